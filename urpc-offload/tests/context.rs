//! End-to-end tests for the asynchronous dispatcher.
//!
//! A second peer attached to the same segment plays the accelerator: it
//! echoes command 1 back as command 2 and is pumped from its own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use urpc::{Field, Peer, Supervisor, Unpacker};
use urpc_offload::{CallArgs, CommandStatus, Context, ContextState, REQUEST_ID_INVALID};

const CMD_ECHO: u16 = 1;
const CMD_ECHO_REPLY: u16 = 2;
const CMD_DOUBLE_REPLY: u16 = 5;

struct Remote {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Remote {
    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            t.join().unwrap();
        }
    }
}

/// Create a host peer plus an echoing remote on its own thread.
fn setup(start_paused: bool) -> (Supervisor, Arc<Peer>, Remote) {
    let mut sup = Supervisor::new();
    let mut host = sup.peer_create().unwrap();
    let segid = host.segment().segid();

    let stop = Arc::new(AtomicBool::new(false));
    let paused = Arc::new(AtomicBool::new(start_paused));

    let thread = {
        let stop = stop.clone();
        let paused = paused.clone();
        thread::spawn(move || {
            let remote = Peer::attach(segid).unwrap();
            remote
                .register_handler(
                    CMD_ECHO,
                    Box::new(|peer, _m, _req, payload| {
                        let mut u = Unpacker::new(payload);
                        let data = match u.bytes() {
                            Ok(d) => d,
                            Err(_) => return -1,
                        };
                        match peer.send_packed(CMD_ECHO_REPLY, &[Field::Bytes(data)]) {
                            Ok(_) => 0,
                            Err(_) => -1,
                        }
                    }),
                )
                .unwrap();
            remote
                .register_handler(
                    CMD_DOUBLE_REPLY,
                    Box::new(|peer, _m, _req, _payload| {
                        // One matched reply plus one the caller never asked for.
                        let _ = peer.send_packed(CMD_ECHO_REPLY, &[Field::U64(1)]);
                        let _ = peer.send_packed(CMD_ECHO_REPLY, &[Field::U64(2)]);
                        0
                    }),
                )
                .unwrap();
            while !stop.load(Ordering::Relaxed) {
                if !paused.load(Ordering::Relaxed) {
                    let _ = remote.recv_progress(8);
                }
                std::hint::spin_loop();
            }
        })
    };

    sup.wait_peer_attach(&mut host).unwrap();
    (
        sup,
        Arc::new(host),
        Remote {
            stop,
            paused,
            thread: Some(thread),
        },
    )
}

fn echo_args(data: &[u8]) -> CallArgs {
    CallArgs::new().bytes(data.to_vec())
}

#[test]
fn echo_once_returns_payload() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let reply_bytes = Arc::new(Mutex::new(Vec::new()));
    let sink = reply_bytes.clone();
    let req = ctx.call_async(CMD_ECHO, echo_args(b"hi"), move |_m, payload| {
        let mut u = Unpacker::new(payload);
        match u.bytes() {
            Ok(d) => {
                sink.lock().unwrap().extend_from_slice(d);
                Ok(0)
            }
            Err(_) => Err(0),
        }
    });
    assert_ne!(req, REQUEST_ID_INVALID);

    let (status, retval) = ctx.wait_result(req);
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(retval, 0);
    assert_eq!(*reply_bytes.lock().unwrap(), vec![0x68, 0x69]);
    assert_eq!(ctx.state(), ContextState::Running);

    ctx.close();
    remote.stop();
}

#[test]
fn many_calls_complete_in_order() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let ids: Vec<_> = (0..100u64)
        .map(|i| ctx.call_async_retval(CMD_ECHO, CallArgs::new().bytes(i.to_le_bytes().to_vec())))
        .collect();
    for id in ids {
        let (status, _) = ctx.wait_result(id);
        assert_eq!(status, CommandStatus::Ok);
    }

    ctx.close();
    remote.stop();
}

#[test]
fn host_command_fences_in_flight_work() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let counter = Arc::new(AtomicU64::new(0));
    for i in 1..=3u64 {
        let counter = counter.clone();
        let id = ctx.call_async(CMD_ECHO, echo_args(b"x"), move |_m, _payload| {
            counter.store(i, Ordering::SeqCst);
            Ok(0)
        });
        assert_ne!(id, REQUEST_ID_INVALID);
    }

    // The host-only callback observes the third echo's result closure.
    let counter_read = counter.clone();
    let host_id = ctx.call_host_async(move || counter_read.load(Ordering::SeqCst));

    let (status, seen) = ctx.wait_result(host_id);
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(seen, 3);

    ctx.close();
    remote.stop();
}

#[test]
fn synchronize_drains_all_queues() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let done = Arc::new(AtomicU64::new(0));
    let mut ids = Vec::new();
    for _ in 0..10 {
        let done = done.clone();
        ids.push(ctx.call_async(CMD_ECHO, echo_args(b"s"), move |_m, _p| {
            done.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }));
    }

    ctx.synchronize();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    for id in ids {
        let (status, _) = ctx.peek_result(id);
        assert_eq!(status, CommandStatus::Ok);
    }

    ctx.close();
    remote.stop();
}

#[test]
fn close_cancels_pending_commands() {
    // The remote never pumps: both calls stay pending.
    let (_sup, host, remote) = setup(true);
    let ctx = Context::new(host);

    let a = ctx.call_async_retval(CMD_ECHO, echo_args(b"a"));
    let b = ctx.call_async_retval(CMD_ECHO, echo_args(b"b"));
    assert_ne!(a, REQUEST_ID_INVALID);
    assert_ne!(b, REQUEST_ID_INVALID);

    ctx.close();
    assert_eq!(ctx.state(), ContextState::Exit);

    let (sa, _) = ctx.wait_result(a);
    let (sb, _) = ctx.wait_result(b);
    assert_eq!(sa, CommandStatus::Error);
    assert_eq!(sb, CommandStatus::Error);

    // Submissions are refused after EXIT.
    assert_eq!(
        ctx.call_async_retval(CMD_ECHO, echo_args(b"c")),
        REQUEST_ID_INVALID
    );
    remote.stop();
}

#[test]
fn wait_timeout_reports_unfinished_then_completes() {
    let (_sup, host, remote) = setup(true);
    let ctx = Context::new(host);

    let id = ctx.call_async_retval(CMD_ECHO, echo_args(b"t"));
    let (status, _) = ctx.wait_result_timeout(id, 1_000);
    assert_eq!(status, CommandStatus::Unfinished);

    // Receiver resumes; the same request now completes.
    remote.paused.store(false, Ordering::Relaxed);
    let (status, _) = ctx.wait_result(id);
    assert_eq!(status, CommandStatus::Ok);

    ctx.close();
    remote.stop();
}

#[test]
fn unexpected_reply_is_fatal_for_the_context() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let id = ctx.call_async_retval(CMD_DOUBLE_REPLY, CallArgs::new().u64(9));
    let (status, _) = ctx.wait_result(id);
    // The matched reply completes normally...
    assert_eq!(status, CommandStatus::Ok);

    // ...and the unmatched one moves the context to EXIT.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while ctx.state() != ContextState::Exit && std::time::Instant::now() < deadline {
        let _ = ctx.peek_result(REQUEST_ID_INVALID);
        thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(ctx.state(), ContextState::Exit);
    assert_eq!(
        ctx.call_async_retval(CMD_ECHO, echo_args(b"x")),
        REQUEST_ID_INVALID
    );
    remote.stop();
}

#[test]
fn peek_of_unknown_request_is_an_error() {
    let (_sup, host, remote) = setup(false);
    let ctx = Context::new(host);

    let (status, _) = ctx.peek_result(1234);
    assert_eq!(status, CommandStatus::Error);

    // A result can only be picked up once.
    let id = ctx.call_async_retval(CMD_ECHO, echo_args(b"q"));
    let (status, _) = ctx.wait_result(id);
    assert_eq!(status, CommandStatus::Ok);
    let (status, _) = ctx.peek_result(id);
    assert_eq!(status, CommandStatus::Error);

    ctx.close();
    remote.stop();
}
