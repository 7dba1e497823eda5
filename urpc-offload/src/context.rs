//! The thread context: asynchronous call submission over one peer.
//!
//! Callers on any thread enqueue commands; a single cooperative progress
//! pump drains the request queue into the transport, matches replies
//! against the in-flight queue in FIFO order, and hands completions to
//! waiters. Wait primitives are busy-polling loops that drive the pump
//! themselves, because the remote side may be a non-interruptible
//! accelerator.
//!
//! Closures handed to `call_async`/`call_host_async` run inside the pump
//! and must not call back into the context.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, warn};
use parking_lot::Mutex;

use urpc::{Mailbox, Peer, Unpacker};

use crate::command::{
    CallArgs, Command, CommandStatus, RequestId, ResultFn, SubmitFn, Work, REQUEST_ID_INVALID,
};
use crate::comq::ComQ;
use crate::error::Error;

/// Context lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    /// No command submitted yet.
    Unknown = 0,
    /// At least one command went through.
    Running = 1,
    /// Closed or hit an unrecoverable error; submissions are refused.
    Exit = 2,
}

enum RecvEvent {
    /// Reply consumed, command completed.
    Done(Command),
    /// The result closure failed; the command carries the exception.
    Fatal(Command),
    /// Reply arrived with nothing in flight.
    Orphan(i64),
}

/// Asynchronous dispatcher over one peer.
pub struct Context {
    peer: Arc<Peer>,
    comq: ComQ,
    state: AtomicU8,
    /// Serialises submissions against close/synchronize.
    submit_mtx: Mutex<()>,
    /// Serialises the progress pump.
    prog_mtx: Mutex<()>,
    /// Request ids that have been handed out and not yet picked up.
    issued: Mutex<HashSet<RequestId>>,
    seq: AtomicU64,
    shutdown_cmd: Option<u16>,
}

impl Context {
    pub fn new(peer: Arc<Peer>) -> Self {
        Context {
            peer,
            comq: ComQ::new(),
            state: AtomicU8::new(ContextState::Unknown as u8),
            submit_mtx: Mutex::new(()),
            prog_mtx: Mutex::new(()),
            issued: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
            shutdown_cmd: None,
        }
    }

    /// Like [`new`](Self::new), with a command id that `close` posts to the
    /// remote side as a shutdown notice.
    pub fn with_shutdown_cmd(peer: Arc<Peer>, cmd: u16) -> Self {
        let mut ctx = Self::new(peer);
        ctx.shutdown_cmd = Some(cmd);
        ctx
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn state(&self) -> ContextState {
        match self.state.load(Ordering::Acquire) {
            0 => ContextState::Unknown,
            1 => ContextState::Running,
            _ => ContextState::Exit,
        }
    }

    /// Call a remote command asynchronously.
    ///
    /// `on_result` consumes the reply: `Ok(retval)` completes the command
    /// with status `Ok`; `Err(retval)` records an exception, which is fatal
    /// for the context. Returns `REQUEST_ID_INVALID` when the context no
    /// longer accepts submissions.
    pub fn call_async<F>(&self, cmd: u16, args: CallArgs, on_result: F) -> RequestId
    where
        F: FnOnce(&Mailbox, &[u8]) -> Result<u64, u64> + Send + 'static,
    {
        let submit: SubmitFn = Box::new(move |peer: &Peer| {
            peer.send_packed(cmd, &args.as_fields()).map_err(|e| {
                warn!("submit of cmd {} failed: {}", cmd, e);
                e.os_code().unwrap_or(-1)
            })
        });
        self.submit(|id| Command::remote(id, submit, Some(Box::new(on_result) as ResultFn)))
    }

    /// [`call_async`](Self::call_async) with the default reply decoding: a
    /// single 64-bit return value (0 for an empty reply payload).
    pub fn call_async_retval(&self, cmd: u16, args: CallArgs) -> RequestId {
        self.call_async(cmd, args, |_m, payload| {
            if payload.is_empty() {
                return Ok(0);
            }
            let mut u = Unpacker::new(payload);
            u.u64().map_err(|_| 0u64)
        })
    }

    /// Schedule a purely local callback. It runs only once the in-flight
    /// queue is empty, so it observes the effects of all prior remote calls
    /// on this context.
    pub fn call_host_async<F>(&self, f: F) -> RequestId
    where
        F: FnOnce() -> u64 + Send + 'static,
    {
        self.submit(|id| Command::host(id, Box::new(f)))
    }

    fn submit(&self, build: impl FnOnce(RequestId) -> Command) -> RequestId {
        if self.state() == ContextState::Exit {
            return REQUEST_ID_INVALID;
        }
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.issued.lock().insert(id);
        {
            let _guard = self.submit_mtx.lock();
            if self.state() == ContextState::Exit {
                self.issued.lock().remove(&id);
                return REQUEST_ID_INVALID;
            }
            self.comq.push_request(build(id));
        }
        self.progress();
        id
    }

    /// Non-blocking check for the result of a request.
    ///
    /// Drives the pump once, then reports `Unfinished` when the reply has
    /// not arrived, or `Error` for an id this context never issued (or that
    /// was already picked up).
    pub fn peek_result(&self, id: RequestId) -> (CommandStatus, u64) {
        self.progress();
        let mut issued = self.issued.lock();
        if !issued.contains(&id) {
            return (CommandStatus::Error, 0);
        }
        match self.comq.take_completion(id) {
            Some(c) => {
                issued.remove(&id);
                (c.status, c.retval)
            }
            None => (CommandStatus::Unfinished, 0),
        }
    }

    /// Spin on [`peek_result`](Self::peek_result) until the command leaves
    /// `Unfinished`.
    pub fn wait_result(&self, id: RequestId) -> (CommandStatus, u64) {
        loop {
            let (status, retval) = self.peek_result(id);
            if status != CommandStatus::Unfinished {
                return (status, retval);
            }
            std::hint::spin_loop();
        }
    }

    /// [`wait_result`](Self::wait_result) bounded by `timeout_us`; reports
    /// `Unfinished` when the window elapses.
    pub fn wait_result_timeout(&self, id: RequestId, timeout_us: u64) -> (CommandStatus, u64) {
        let start = Instant::now();
        loop {
            let (status, retval) = self.peek_result(id);
            if status != CommandStatus::Unfinished {
                return (status, retval);
            }
            if start.elapsed().as_micros() as u64 >= timeout_us {
                return (CommandStatus::Unfinished, 0);
            }
            std::hint::spin_loop();
        }
    }

    /// Drain the request and in-flight queues. All asynchronous calls
    /// submitted before this returns have completed.
    pub fn synchronize(&self) {
        let _guard = self.submit_mtx.lock();
        while !(self.comq.request_is_empty() && self.comq.in_flight_is_empty()) {
            if self.state() == ContextState::Exit {
                break;
            }
            self.progress();
        }
    }

    /// Close the context: post the shutdown command if one is configured,
    /// transition to EXIT, and cancel everything pending so waiters observe
    /// status `Error`. Idempotent.
    pub fn close(&self) {
        if self.state() == ContextState::Exit {
            return;
        }
        // Lock order submit → prog matches every other path, and holding
        // both keeps the pump from re-queueing work while we cancel.
        let _submit = self.submit_mtx.lock();
        let _prog = self.prog_mtx.lock();
        if self.state() == ContextState::Exit {
            return;
        }
        if let Some(cmd) = self.shutdown_cmd {
            if let Err(e) = self.peer.send_packed(cmd, &[]) {
                warn!("shutdown command failed: {}", e);
            }
        }
        self.state
            .store(ContextState::Exit as u8, Ordering::Release);
        self.comq.cancel_all();
    }

    /// Drive the pump. Serialised; callers from any thread.
    fn progress(&self) {
        let _guard = self.prog_mtx.lock();
        self.progress_nolock();
    }

    fn progress_nolock(&self) {
        loop {
            if self.state() == ContextState::Exit {
                return;
            }
            let mut advanced = false;

            match self.pump_recv() {
                Ok(moved) => advanced |= moved,
                Err(e) => {
                    error!("progress: {}", e);
                    self.fatal_exit();
                    return;
                }
            }
            if self.state() == ContextState::Exit {
                return;
            }
            match self.pump_send() {
                Ok(moved) => advanced |= moved,
                Err(e) => {
                    error!("progress: {}", e);
                    self.fatal_exit();
                    return;
                }
            }
            if !advanced {
                return;
            }
        }
    }

    /// Consume at most one reply. The in-flight queue must match it in FIFO
    /// order; anything else is a protocol violation.
    fn pump_recv(&self) -> Result<bool, Error> {
        let event = self
            .peer
            .poll_cmd(|m, req, payload| match self.comq.pop_in_flight() {
                None => RecvEvent::Orphan(req),
                Some(mut cmd) => match cmd.on_result.take() {
                    None => {
                        cmd.set_result(0, CommandStatus::Ok);
                        RecvEvent::Done(cmd)
                    }
                    Some(f) => match f(m, payload) {
                        Ok(rv) => {
                            cmd.set_result(rv, CommandStatus::Ok);
                            RecvEvent::Done(cmd)
                        }
                        Err(rv) => {
                            cmd.set_result(rv, CommandStatus::Exception);
                            RecvEvent::Fatal(cmd)
                        }
                    },
                },
            })
            .map_err(Error::Transport)?;

        match event {
            None => Ok(false),
            Some(RecvEvent::Done(cmd)) => {
                self.comq.push_completion(cmd);
                Ok(true)
            }
            Some(RecvEvent::Fatal(cmd)) => {
                error!("result closure failed for request {}", cmd.id);
                self.comq.push_completion(cmd);
                self.fatal_exit();
                Ok(false)
            }
            Some(RecvEvent::Orphan(req)) => Err(Error::ProtocolViolation(req)),
        }
    }

    /// Submit at most one queued command.
    fn pump_send(&self) -> Result<bool, Error> {
        if !self.peer.next_send_slot_free() {
            return Ok(false);
        }
        let Some(mut cmd) = self.comq.pop_submittable() else {
            return Ok(false);
        };
        match cmd.work.take() {
            Some(Work::Host(run)) => {
                let rv = run();
                cmd.set_result(rv, CommandStatus::Ok);
                self.comq.push_completion(cmd);
            }
            Some(Work::Remote(submit)) => match submit(&self.peer) {
                Ok(_req) => {
                    let _ = self.state.compare_exchange(
                        ContextState::Unknown as u8,
                        ContextState::Running as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.comq.push_in_flight(cmd);
                }
                Err(rc) => {
                    warn!("{}", Error::SubmitFailed(rc));
                    cmd.set_result(0, CommandStatus::Error);
                    self.comq.push_completion(cmd);
                }
            },
            None => {
                cmd.set_result(0, CommandStatus::Error);
                self.comq.push_completion(cmd);
            }
        }
        Ok(true)
    }

    fn fatal_exit(&self) {
        self.state
            .store(ContextState::Exit as u8, Ordering::Release);
        self.comq.cancel_all();
    }
}
