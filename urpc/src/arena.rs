//! Producer-side payload arena.
//!
//! Payload bytes live in the transfer queue's data buffer; the producer
//! hands out intervals with a bump cursor and reclaims them lazily, driven
//! by the consumer clearing mailbox command fields. The free region is
//! `[free_begin, free_end)`; reclamation extends `free_end` over completed
//! slots in FIFO order, and the wrap back to offset 0 is performed by
//! attributing the unusable tail to the most recently sent slot so it comes
//! back in one piece when that slot completes.
//!
//! The `mlist` mirror of `{offs, len}` per slot is process-local
//! bookkeeping; the consumer never sees it.

use std::sync::atomic::Ordering;
use std::time::Instant;

use log::error;

use crate::layout::{
    align8, req2slot, Mailbox, TransferQueue, URPC_CMD_NONE, URPC_DATA_BUFF_LEN, URPC_LEN_MB,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
struct MirrorEntry {
    offs: u32,
    len: u32,
}

/// Arena state for one send communicator.
pub struct Arena {
    mlist: [MirrorEntry; URPC_LEN_MB],
    free_begin: u32,
    free_end: u32,
}

impl Arena {
    pub fn new() -> Self {
        Arena {
            mlist: [MirrorEntry::default(); URPC_LEN_MB],
            free_begin: 0,
            free_end: URPC_DATA_BUFF_LEN as u32,
        }
    }

    #[inline]
    fn free_len(&self) -> u32 {
        self.free_end - self.free_begin
    }

    /// Allocate a payload interval of `size` bytes (8-aligned internally).
    ///
    /// Runs reclamation under pressure and spins until `timeout_us` when the
    /// consumer is behind. Returns a mailbox word with an empty command
    /// field and `offs`/`len` filled in.
    pub fn alloc(&mut self, tq: &TransferQueue, size: u32, timeout_us: u64) -> Result<Mailbox> {
        let asize = align8(size);
        debug_assert!(asize as usize <= URPC_DATA_BUFF_LEN);
        let start = Instant::now();

        while self.free_len() < asize {
            if self.gc(tq) >= asize {
                break;
            }
            if start.elapsed().as_micros() as u64 > timeout_us {
                error!("alloc_payload timed out ({} bytes)", size);
                return Err(Error::AllocTimeout);
            }
            std::hint::spin_loop();
        }

        let offs = self.free_begin;
        self.free_begin += asize;
        Ok(Mailbox::new(URPC_CMD_NONE, offs, size))
    }

    /// Reclaim payload intervals of finished requests. Returns the free
    /// byte count afterwards.
    pub fn gc(&mut self, tq: &TransferQueue) -> u32 {
        let last_req = tq.last_put(Ordering::Acquire);
        let last_slot = req2slot(last_req);

        // At the end of the buffer: hand the unusable tail to the most
        // recently sent slot and wrap the cursors, so the tail comes back
        // when that slot completes.
        if self.free_end == URPC_DATA_BUFF_LEN as u32 {
            let ml = &mut self.mlist[last_slot];
            if ml.len == 0 {
                ml.offs = self.free_begin;
            }
            ml.len = self.free_end - ml.offs;
            self.free_begin = 0;
            self.free_end = 0;
        }

        // Walk slots oldest-first and fold completed intervals back into the
        // free region. Only a contiguous extension keeps the invariant that
        // the free region never overlaps a live slot, so anything freed out
        // of order waits for a later pass.
        for i in 1..=URPC_LEN_MB {
            let slot = (last_slot + i) % URPC_LEN_MB;
            let ml = self.mlist[slot];
            if ml.len == 0 {
                continue;
            }
            if !tq.mb_load(slot, Ordering::Acquire).is_free() {
                continue;
            }
            if self.free_end < URPC_DATA_BUFF_LEN as u32 && ml.offs == self.free_end {
                self.free_end = align8(ml.offs + ml.len);
                self.mlist[slot] = MirrorEntry::default();
                tq.mb_store(slot, Mailbox::empty(), Ordering::Release);
            }
        }

        self.free_len()
    }

    /// Fold the slot's previous payload back into the free region before the
    /// slot is reused, when it sits right at the free tail.
    pub(crate) fn note_slot_reuse(&mut self, slot: usize) {
        let ml = self.mlist[slot];
        if ml.len != 0
            && self.free_end < URPC_DATA_BUFF_LEN as u32
            && ml.offs == self.free_end
        {
            self.free_end = align8(ml.offs + ml.len);
            self.mlist[slot] = MirrorEntry::default();
        }
    }

    /// Record the payload interval a slot now carries.
    pub(crate) fn record(&mut self, slot: usize, m: Mailbox) {
        if m.len() != 0 {
            self.mlist[slot] = MirrorEntry {
                offs: m.offs(),
                len: m.len(),
            };
        } else {
            self.mlist[slot] = MirrorEntry::default();
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
