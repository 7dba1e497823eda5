//! Mailbox ring operations.
//!
//! Each transfer queue is a single-producer/single-consumer ring of 64-bit
//! mailbox words indexed by a monotonically increasing request id. The
//! producer publishes the mailbox with a release store, then the advanced
//! `last_put_req`; the consumer observes `last_put_req` with an acquire load
//! before reading the slot. Clearing a slot back to `URPC_CMD_NONE` on the
//! consumer side is the only place a full fence is required, because the
//! producer's reclamation path reads the slot from outside the
//! counter-ordered protocol.

use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use log::trace;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::layout::{req2slot, Mailbox, TransferQueue, URPC_CMD_NONE};

impl TransferQueue {
    /// Put a command in the next mailbox slot.
    ///
    /// Spins while the slot is still occupied, bounded by `timeout_us`.
    /// Returns the request id.
    pub fn put_cmd(&self, arena: &mut Arena, m: Mailbox, timeout_us: u64) -> Result<i64> {
        let req = self.last_put(Ordering::Relaxed) + 1;
        let slot = req2slot(req);

        let start = Instant::now();
        while !self.mb_load(slot, Ordering::Acquire).is_free() {
            if start.elapsed().as_micros() as u64 > timeout_us {
                return Err(Error::PutTimeout);
            }
            std::hint::spin_loop();
        }

        arena.note_slot_reuse(slot);
        arena.record(slot, m);

        self.mb_store(slot, m, Ordering::Release);
        self.set_last_put(req);
        trace!(
            "put_cmd req={} cmd={} offs={} len={}",
            req,
            m.cmd(),
            m.offs(),
            m.len()
        );
        Ok(req)
    }

    /// Pull the next command from the queue, or `None` when it is empty.
    pub fn get_cmd(&self) -> Option<(i64, Mailbox)> {
        let last_put = self.last_put(Ordering::Acquire);
        let last_get = self.last_get(Ordering::Relaxed);
        if last_put == last_get {
            return None;
        }
        let req = last_get + 1;
        let slot = req2slot(req);
        let m = self.mb_load(slot, Ordering::Acquire);
        trace!(
            "get_cmd req={} cmd={} offs={} len={}",
            req,
            m.cmd(),
            m.offs(),
            m.len()
        );
        self.set_last_get(req);
        Some((req, m))
    }

    /// Peek a specific request.
    ///
    /// Advances the consumer cursor only when `req` is the next command in
    /// line. Returns `None` when the request was already consumed or has not
    /// been published yet.
    pub fn get_req(&self, req: i64) -> Option<Mailbox> {
        let last_put = self.last_put(Ordering::Acquire);
        let last_get = self.last_get(Ordering::Relaxed);

        if last_get >= req {
            trace!("get_req: req {} already handled", req);
            return None;
        }
        if last_put < req {
            return None;
        }
        let m = self.mb_load(req2slot(req), Ordering::Acquire);
        if last_get + 1 == req {
            self.set_last_get(req);
        }
        Some(m)
    }

    /// Erase the command field of a slot, marking the command as done.
    ///
    /// Runs on the consumer side; the associated payload interval is
    /// reclaimed later on the sender side. Idempotent after the first call.
    pub fn slot_done(&self, slot: usize, m: Mailbox) {
        let cleared = m.with_cmd(URPC_CMD_NONE);
        fence(Ordering::SeqCst);
        self.mb_store(slot, cleared, Ordering::Release);
    }

    /// Whether the next producer slot is free, without claiming it.
    pub fn next_send_slot_free(&self) -> bool {
        let req = self.last_put(Ordering::Relaxed) + 1;
        self.mb_load(req2slot(req), Ordering::Acquire).is_free()
    }
}
