//! The peer object: one shared segment bound to a send communicator, a recv
//! communicator, and a handler table.
//!
//! The creator sees the first half of the segment as its send queue and the
//! second half as its recv queue; an attacher sees them swapped, so each
//! side produces into the queue the other consumes. Many application
//! threads may share one peer: the send side is serialised by a coarse
//! mutex, and the recv side is consumed by whichever thread runs progress.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::arena::Arena;
use crate::codec::{pack, packed_size, Field};
use crate::dma::{DmaEngine, Mirror};
use crate::error::{Error, Result};
use crate::layout::{
    req2slot, Mailbox, TransferQueue, URPC_ALLOC_TIMEOUT_US, URPC_BUFF_LEN, URPC_CMD_NONE,
    URPC_MAX_HANDLERS, URPC_PUT_TIMEOUT_US,
};
use crate::shm::SharedSegment;

/// Environment variable carrying the segment id to the remote binary.
pub const ENV_SHM_SEGID: &str = "URPC_SHM_SEGID";

/// Command handler: `(peer, mailbox, request id, payload)`.
///
/// A non-zero return is logged and swallowed so one bad command cannot
/// stall progress. Handlers run with the recv communicator held and must
/// not re-enter the receive path.
pub type Handler = Box<dyn Fn(&Peer, &Mailbox, i64, &[u8]) -> i32 + Send + Sync>;

/// Tunable spin bounds for one peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Bound on the payload-allocation spin, in microseconds.
    pub alloc_timeout_us: u64,
    /// Bound on the busy-slot spin in `put_cmd`, in microseconds.
    pub put_timeout_us: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            alloc_timeout_us: URPC_ALLOC_TIMEOUT_US,
            put_timeout_us: URPC_PUT_TIMEOUT_US,
        }
    }
}

/// Which direction of the peer a flag access refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Send,
    Recv,
}

struct SendState {
    arena: Arena,
    mirror: Option<Mirror>,
}

struct RecvState {
    mirror: Option<Mirror>,
}

/// A two-way transport endpoint backed by one shared-memory segment.
pub struct Peer {
    seg: SharedSegment,
    send_tq: *const TransferQueue,
    recv_tq: *const TransferQueue,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    handlers: RwLock<Vec<Option<Handler>>>,
    cfg: PeerConfig,
    child_pid: Mutex<Option<Pid>>,
}

// The raw queue pointers live inside `seg`, which the peer owns; all
// cross-thread access goes through atomics or the communicator mutexes.
unsafe impl Send for Peer {}
unsafe impl Sync for Peer {}

impl Peer {
    /// Bind a segment to a peer. `swapped` selects the attacher's view
    /// (send queue in the second half). `engine` installs mirror buffers on
    /// both communicators for the accelerator data path.
    pub(crate) fn from_segment(
        seg: SharedSegment,
        swapped: bool,
        engine: Option<Arc<dyn DmaEngine>>,
        cfg: PeerConfig,
    ) -> Self {
        let base = seg.base();
        let (send_off, recv_off) = if swapped {
            (URPC_BUFF_LEN, 0)
        } else {
            (0, URPC_BUFF_LEN)
        };
        let send_tq = unsafe { base.add(send_off) } as *const TransferQueue;
        let recv_tq = unsafe { base.add(recv_off) } as *const TransferQueue;

        let (send_mirror, recv_mirror) = match engine {
            Some(engine) => {
                let send_dva = unsafe { (*send_tq).data_ptr() } as u64;
                let recv_dva = unsafe { (*recv_tq).data_ptr() } as u64;
                (
                    Some(Mirror::new(send_dva, engine.clone())),
                    Some(Mirror::new(recv_dva, engine)),
                )
            }
            None => (None, None),
        };

        let mut handlers = Vec::with_capacity(URPC_MAX_HANDLERS as usize + 1);
        handlers.resize_with(URPC_MAX_HANDLERS as usize + 1, || None);

        Peer {
            seg,
            send_tq,
            recv_tq,
            send: Mutex::new(SendState {
                arena: Arena::new(),
                mirror: send_mirror,
            }),
            recv: Mutex::new(RecvState { mirror: recv_mirror }),
            handlers: RwLock::new(handlers),
            cfg,
            child_pid: Mutex::new(None),
        }
    }

    /// Attach the remote end of an existing segment (host-visible payload
    /// view, no DMA).
    pub fn attach(segid: i32) -> Result<Self> {
        Self::attach_with(segid, PeerConfig::default())
    }

    /// [`attach`](Self::attach) with explicit spin bounds.
    pub fn attach_with(segid: i32, cfg: PeerConfig) -> Result<Self> {
        let seg = SharedSegment::attach(segid, 2 * URPC_BUFF_LEN)?;
        Ok(Self::from_segment(seg, true, None, cfg))
    }

    /// Attach as the accelerator-side peer: payloads move through mirror
    /// buffers driven by `engine`.
    pub fn attach_accelerator(segid: i32, engine: Arc<dyn DmaEngine>) -> Result<Self> {
        let seg = SharedSegment::attach(segid, 2 * URPC_BUFF_LEN)?;
        Ok(Self::from_segment(seg, true, Some(engine), PeerConfig::default()))
    }

    /// Attach using the segment id handed over in `URPC_SHM_SEGID`.
    pub fn attach_from_env() -> Result<Self> {
        let segid = std::env::var(ENV_SHM_SEGID)
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| {
                Error::Os(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "URPC_SHM_SEGID not set or unparsable",
                ))
            })?;
        Self::attach(segid)
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.seg
    }

    pub(crate) fn segment_mut(&mut self) -> &mut SharedSegment {
        &mut self.seg
    }

    pub(crate) fn child_pid(&self) -> &Mutex<Option<Pid>> {
        &self.child_pid
    }

    #[inline]
    fn send_queue(&self) -> &TransferQueue {
        unsafe { &*self.send_tq }
    }

    #[inline]
    fn recv_queue(&self) -> &TransferQueue {
        unsafe { &*self.recv_tq }
    }

    /// Register a handler for `cmd`.
    pub fn register_handler(&self, cmd: u16, handler: Handler) -> Result<()> {
        if cmd == URPC_CMD_NONE || cmd > URPC_MAX_HANDLERS {
            return Err(Error::HandlerSlot(cmd));
        }
        let mut table = self.handlers.write();
        if table[cmd as usize].is_some() {
            return Err(Error::HandlerSlot(cmd));
        }
        table[cmd as usize] = Some(handler);
        Ok(())
    }

    /// Unregister the handler for `cmd`.
    pub fn unregister_handler(&self, cmd: u16) -> Result<()> {
        if cmd == URPC_CMD_NONE || cmd > URPC_MAX_HANDLERS {
            return Err(Error::HandlerSlot(cmd));
        }
        self.handlers.write()[cmd as usize] = None;
        Ok(())
    }

    /// Pack `fields` into a payload and put `cmd` in the next mailbox slot.
    /// Returns the request id on the send queue.
    pub fn send_packed(&self, cmd: u16, fields: &[Field<'_>]) -> Result<i64> {
        if cmd == URPC_CMD_NONE || u64::from(cmd) > 0xfff {
            return Err(Error::BadCommand(cmd));
        }
        let size = packed_size(fields) as u32;

        let mut st = self.send.lock();
        let tq = self.send_queue();

        let desc = if size > 0 {
            let desc = st.arena.alloc(tq, size, self.cfg.alloc_timeout_us)?;
            match st.mirror.as_mut() {
                Some(mirror) => {
                    pack(fields, mirror.payload_mut(desc.offs(), size))?;
                    mirror.flush_out(&desc)?;
                }
                None => {
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(
                            tq.data_ptr().add(desc.offs() as usize),
                            size as usize,
                        )
                    };
                    pack(fields, dst)?;
                }
            }
            desc
        } else {
            Mailbox::empty()
        };

        tq.put_cmd(&mut st.arena, desc.with_cmd(cmd), self.cfg.put_timeout_us)
    }

    /// Whether the next send slot is free, without claiming it.
    pub fn next_send_slot_free(&self) -> bool {
        self.send_queue().next_send_slot_free()
    }

    /// Pull the next command from the recv queue, hand its payload view to
    /// `f`, then mark the slot done. Returns `Ok(None)` when the queue is
    /// empty.
    pub fn poll_cmd<R>(&self, f: impl FnOnce(&Mailbox, i64, &[u8]) -> R) -> Result<Option<R>> {
        let mut st = self.recv.lock();
        let tq = self.recv_queue();

        let Some((req, m)) = tq.get_cmd() else {
            return Ok(None);
        };
        self.run_on_payload(&mut st, req, m, f).map(Some)
    }

    /// Wait for a particular request on the recv queue, bounded by
    /// `timeout_us`. On success hands the payload view to `f` and marks the
    /// slot done; returns `Ok(None)` when the request did not show up.
    pub fn recv_req_timeout<R>(
        &self,
        req: i64,
        timeout_us: u64,
        f: impl FnOnce(&Mailbox, i64, &[u8]) -> R,
    ) -> Result<Option<R>> {
        let start = Instant::now();
        loop {
            {
                let mut st = self.recv.lock();
                let tq = self.recv_queue();
                if let Some(m) = tq.get_req(req) {
                    return self.run_on_payload(&mut st, req, m, f).map(Some);
                }
            }
            if start.elapsed().as_micros() as u64 >= timeout_us {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    fn run_on_payload<R>(
        &self,
        st: &mut RecvState,
        req: i64,
        m: Mailbox,
        f: impl FnOnce(&Mailbox, i64, &[u8]) -> R,
    ) -> Result<R> {
        let tq = self.recv_queue();
        let view: Result<&[u8]> = if m.len() == 0 {
            Ok(&[])
        } else {
            match st.mirror.as_mut() {
                Some(mirror) => mirror.fetch(tq, &m),
                None => Ok(unsafe {
                    std::slice::from_raw_parts(
                        tq.data_ptr().add(m.offs() as usize),
                        m.len() as usize,
                    )
                }),
            }
        };
        match view {
            Ok(payload) => {
                let r = f(&m, req, payload);
                tq.slot_done(req2slot(req), m);
                Ok(r)
            }
            Err(e) => {
                // The command cannot be delivered; retire the slot so the
                // ring keeps moving and report the transport error.
                tq.slot_done(req2slot(req), m);
                Err(e)
            }
        }
    }

    /// Process at most `ncmds` commands from the recv queue, dispatching to
    /// registered handlers. Returns the number of commands handled.
    pub fn recv_progress(&self, ncmds: usize) -> Result<usize> {
        let mut done = 0;
        while done < ncmds {
            let handled = self.poll_cmd(|m, req, payload| {
                let table = self.handlers.read();
                match table.get(m.cmd() as usize).and_then(|h| h.as_ref()) {
                    Some(func) => {
                        let rc = func(self, m, req, payload);
                        if rc != 0 {
                            warn!("RPC handler {} returned {}", m.cmd(), rc);
                        }
                    }
                    None => {
                        debug!("no handler for cmd {} (req {})", m.cmd(), req);
                    }
                }
            })?;
            if handled.is_none() {
                break;
            }
            done += 1;
        }
        Ok(done)
    }

    /// Run [`recv_progress`](Self::recv_progress) until the queue has been
    /// quiet for `timeout_us`. Returns the total number of commands
    /// processed during the call.
    pub fn recv_progress_timeout(&self, ncmds: usize, timeout_us: u64) -> Result<usize> {
        let mut total = 0;
        let mut quiet_since: Option<Instant> = None;
        loop {
            let done = self.recv_progress(ncmds)?;
            total += done;
            if done == 0 {
                let since = quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed().as_micros() as u64 >= timeout_us {
                    return Ok(total);
                }
                std::hint::spin_loop();
            } else {
                quiet_since = None;
            }
        }
    }

    /// Read the flag word of one queue.
    pub fn flags(&self, queue: Queue, receiver: bool) -> u32 {
        let tq = match queue {
            Queue::Send => self.send_queue(),
            Queue::Recv => self.recv_queue(),
        };
        if receiver {
            tq.receiver_flags()
        } else {
            tq.sender_flags()
        }
    }

    /// Write the flag word of one queue.
    pub fn set_flags(&self, queue: Queue, receiver: bool, value: u32) {
        let tq = match queue {
            Queue::Send => self.send_queue(),
            Queue::Recv => self.recv_queue(),
        };
        if receiver {
            tq.set_receiver_flags(value)
        } else {
            tq.set_sender_flags(value)
        }
    }

    /// Consumer-side cursor of the send queue, for observing how far the
    /// remote got.
    pub fn send_queue_consumed(&self) -> i64 {
        self.send_queue().last_get(Ordering::Acquire)
    }
}
