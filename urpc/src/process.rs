//! Host-side supervisor: segment and peer creation, child-process spawn
//! with environment hand-off, attach rendezvous, teardown.

use std::ffi::CString;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, getpid, ForkResult};

use crate::error::{Error, Result};
use crate::layout::{TransferQueue, URPC_BUFF_LEN, URPC_DELAY_PEEK_US, URPC_MAX_PEERS};
use crate::peer::{Peer, PeerConfig, ENV_SHM_SEGID};
use crate::shm::SharedSegment;

/// Environment variable selecting the accelerator node for the child.
pub const ENV_NODE_NUMBER: &str = "VE_NODE_NUMBER";
/// Optional core pin for the child.
pub const ENV_CORE: &str = "URPC_VE_CORE";
/// Optional override of the child binary path.
pub const ENV_BIN_OVERRIDE: &str = "URPC_VE_BIN";

/// Attach-rendezvous poll interval.
const ATTACH_POLL: Duration = Duration::from_micros(URPC_DELAY_PEEK_US);

// Segment keys are derived from `pid * URPC_MAX_PEERS + index`. The index
// is process-wide so two supervisors in one process never race onto the
// same key; the liveness ceiling stays per-supervisor.
static NEXT_KEY_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Hook run on every freshly created peer, before it is handed out.
pub type HandlerInitHook = Box<dyn Fn(&Peer) + Send + Sync>;

/// Owner of the live-peer registry and the child processes serving them.
pub struct Supervisor {
    live_peers: usize,
    handler_init: Option<HandlerInitHook>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            live_peers: 0,
            handler_init: None,
        }
    }

    /// Install a hook that registers handlers on each new peer.
    pub fn set_handler_init_hook(&mut self, hook: HandlerInitHook) {
        self.handler_init = Some(hook);
    }

    /// Allocate a fresh segment and bind the host-side peer to it.
    pub fn peer_create(&mut self) -> Result<Peer> {
        self.peer_create_with(PeerConfig::default())
    }

    /// [`peer_create`](Self::peer_create) with explicit spin bounds.
    pub fn peer_create_with(&mut self, cfg: PeerConfig) -> Result<Peer> {
        if self.live_peers == URPC_MAX_PEERS {
            error!("maximum number of urpc peers reached");
            return Err(Error::PeerLimit);
        }

        let index = NEXT_KEY_INDEX.fetch_add(1, Ordering::Relaxed) % URPC_MAX_PEERS;
        let key = getpid().as_raw() * URPC_MAX_PEERS as i32 + index as i32;
        let seg = SharedSegment::create(key, 2 * URPC_BUFF_LEN)?;

        // Zero both queues before any attacher can observe the segment.
        unsafe {
            (*(seg.base() as *const TransferQueue)).init();
            (*(seg.base().add(URPC_BUFF_LEN) as *const TransferQueue)).init();
        }

        let peer = Peer::from_segment(seg, false, None, cfg);
        if let Some(hook) = &self.handler_init {
            hook(&peer);
        }
        self.live_peers += 1;
        debug!(
            "peer created: key={} segid={}",
            key,
            peer.segment().segid()
        );
        Ok(peer)
    }

    /// Tear a peer down: kill its child if one is still recorded, detach and
    /// free the segment, release the registry slot.
    pub fn peer_destroy(&mut self, peer: Peer) -> Result<()> {
        let _ = self.child_destroy(&peer);
        drop(peer);
        self.live_peers -= 1;
        Ok(())
    }

    /// Spawn the remote peer process for `peer`.
    ///
    /// The child receives the segment id, the accelerator node, and an
    /// optional core pin through the environment, then execs `binary`
    /// (or the `URPC_VE_BIN` override) with an empty argument tail.
    pub fn child_create(
        &mut self,
        peer: &Peer,
        binary: &Path,
        venode_id: i32,
        ve_core: i32,
    ) -> Result<()> {
        std::fs::metadata(binary)?;

        // The override applies only to what the child execs, not to the
        // existence check above.
        let exec_path = match std::env::var_os(ENV_BIN_OVERRIDE) {
            Some(over) => std::path::PathBuf::from(over),
            None => binary.to_path_buf(),
        };
        let path = CString::new(exec_path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::Os(std::io::Error::other("binary path contains NUL")))?;
        let argv = [path.clone()];

        // Assemble the child environment before forking; nothing below the
        // fork allocates.
        let mut env: Vec<CString> = std::env::vars_os()
            .filter(|(k, _)| {
                k.to_str()
                    .map_or(true, |s| s != ENV_SHM_SEGID && s != ENV_NODE_NUMBER && s != ENV_CORE)
            })
            .filter_map(|(k, v)| {
                let mut bytes = k.into_encoded_bytes();
                bytes.push(b'=');
                bytes.extend(v.into_encoded_bytes());
                CString::new(bytes).ok()
            })
            .collect();
        env.push(
            CString::new(format!("{}={}", ENV_SHM_SEGID, peer.segment().segid())).unwrap(),
        );
        env.push(CString::new(format!("{}={}", ENV_NODE_NUMBER, venode_id)).unwrap());
        if ve_core >= 0 {
            env.push(CString::new(format!("{}={}", ENV_CORE, ve_core)).unwrap());
        }

        match unsafe { fork() }.map_err(|e| Error::ChildSpawn(e as i32))? {
            ForkResult::Child => {
                let _ = nix::unistd::execve(&path, &argv, &env);
                // Only reached when execve failed.
                unsafe { libc::_exit(errno_raw()) }
            }
            ForkResult::Parent { child } => {
                *peer.child_pid().lock() = Some(child);
                debug!("child {} spawned for segid {}", child, peer.segment().segid());
                Ok(())
            }
        }
    }

    /// Kill the recorded child process, if any.
    pub fn child_destroy(&self, peer: &Peer) -> Result<()> {
        let mut pid = peer.child_pid().lock();
        match pid.take() {
            Some(p) => kill(p, Signal::SIGKILL).map_err(|e| Error::Os(e.into())),
            None => Err(Error::NoChild),
        }
    }

    /// Block until the segment shows two attached processes, then mark it
    /// destroyed so the OS reaps it once both detach.
    pub fn wait_peer_attach(&self, peer: &mut Peer) -> Result<()> {
        loop {
            if peer.segment().nattch()? >= 2 {
                break;
            }
            std::thread::sleep(ATTACH_POLL);
        }
        peer.segment_mut().mark_removed()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn errno_raw() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(1)
}
