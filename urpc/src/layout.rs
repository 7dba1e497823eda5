//! Bit-exact shared-memory layout: the mailbox word and the per-direction
//! transfer queue.
//!
//! Both endpoints map the same segment and agree on these shapes at compile
//! time. All integer fields are little-endian and 8-byte aligned; atomics are
//! referenced in place inside the mapped region.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Mailbox slots per direction.
pub const URPC_LEN_MB: usize = 64;

/// Payload arena bytes per direction.
pub const URPC_DATA_BUFF_LEN: usize = 64 * 1024;

/// Highest user-assignable command id.
pub const URPC_MAX_HANDLERS: u16 = 128;

/// Live peers per process.
pub const URPC_MAX_PEERS: usize = 32;

/// Command value marking a slot as free or completed.
pub const URPC_CMD_NONE: u16 = 0;

/// Bound on the payload-allocation spin, in microseconds.
pub const URPC_ALLOC_TIMEOUT_US: u64 = 10_000_000;

/// Bound on the busy-slot spin in `put_cmd`, in microseconds.
pub const URPC_PUT_TIMEOUT_US: u64 = 10_000_000;

/// Attach-rendezvous poll interval, in microseconds.
pub const URPC_DELAY_PEEK_US: u64 = 100;

/// Payloads at or below this length take the inline receive path on the
/// accelerator side; longer ones go through DMA. Observable, do not change.
pub const INLINE_PAYLOAD_MAX: usize = 16;

/// Shared footprint of one direction.
pub const URPC_BUFF_LEN: usize = mem::size_of::<TransferQueue>();

const CMD_BITS: u32 = 12;
const OFFS_BITS: u32 = 20;
const CMD_MASK: u64 = (1 << CMD_BITS) - 1;
const OFFS_MASK: u64 = (1 << OFFS_BITS) - 1;

/// Map a request id onto its mailbox slot.
#[inline]
pub fn req2slot(req: i64) -> usize {
    (req as u64 % URPC_LEN_MB as u64) as usize
}

/// Round up to the next 8-byte boundary.
#[inline]
pub fn align8(v: u32) -> u32 {
    (v + 7) & !7
}

/// One 64-bit mailbox word: `cmd:12 | offs:20 | len:32`, `cmd` in the low
/// bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox(u64);

impl Mailbox {
    /// Build a mailbox word. Field ranges are a layout contract; exceeding
    /// them corrupts neighbouring fields.
    #[inline]
    pub fn new(cmd: u16, offs: u32, len: u32) -> Self {
        debug_assert!((cmd as u64) <= CMD_MASK);
        debug_assert!((offs as u64) <= OFFS_MASK);
        Mailbox((cmd as u64) | ((offs as u64) << CMD_BITS) | ((len as u64) << 32))
    }

    /// The empty word (free slot, no payload).
    #[inline]
    pub fn empty() -> Self {
        Mailbox(0)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Mailbox(raw)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn cmd(&self) -> u16 {
        (self.0 & CMD_MASK) as u16
    }

    #[inline]
    pub fn offs(&self) -> u32 {
        ((self.0 >> CMD_BITS) & OFFS_MASK) as u32
    }

    #[inline]
    pub fn len(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.cmd() == URPC_CMD_NONE
    }

    /// Same word with the command field replaced.
    #[inline]
    pub fn with_cmd(self, cmd: u16) -> Self {
        debug_assert!((cmd as u64) <= CMD_MASK);
        Mailbox((self.0 & !CMD_MASK) | cmd as u64)
    }
}

/// One direction of a peer, living at a fixed offset inside the shared
/// segment. The producer writes mailboxes and `last_put_req`; the consumer
/// writes `last_get_req` and clears command fields.
#[repr(C)]
pub struct TransferQueue {
    mb: [AtomicU64; URPC_LEN_MB],
    sender_flags: AtomicU32,
    receiver_flags: AtomicU32,
    last_put_req: AtomicI64,
    last_get_req: AtomicI64,
    data: UnsafeCell<[u8; URPC_DATA_BUFF_LEN]>,
}

// Raced by design: each field has exactly one writer under the SPSC
// protocol, and the data area is published via mailbox ordering.
unsafe impl Sync for TransferQueue {}

const _: () = assert!(
    mem::size_of::<TransferQueue>() == URPC_LEN_MB * 8 + 2 * 4 + 2 * 8 + URPC_DATA_BUFF_LEN
);
const _: () = assert!(mem::align_of::<TransferQueue>() == 8);

impl TransferQueue {
    /// Reset the queue to its initial state: mailboxes and flags zeroed,
    /// request counters at −1. Runs on the creator before any attacher can
    /// observe the segment.
    pub fn init(&self) {
        for m in &self.mb {
            m.store(0, Ordering::Relaxed);
        }
        self.sender_flags.store(0, Ordering::Relaxed);
        self.receiver_flags.store(0, Ordering::Relaxed);
        self.last_put_req.store(-1, Ordering::Relaxed);
        self.last_get_req.store(-1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn mb_load(&self, slot: usize, order: Ordering) -> Mailbox {
        Mailbox::from_raw(self.mb[slot].load(order))
    }

    #[inline]
    pub(crate) fn mb_store(&self, slot: usize, m: Mailbox, order: Ordering) {
        self.mb[slot].store(m.raw(), order);
    }

    #[inline]
    pub(crate) fn last_put(&self, order: Ordering) -> i64 {
        self.last_put_req.load(order)
    }

    #[inline]
    pub(crate) fn set_last_put(&self, req: i64) {
        self.last_put_req.store(req, Ordering::Release);
    }

    #[inline]
    pub(crate) fn last_get(&self, order: Ordering) -> i64 {
        self.last_get_req.load(order)
    }

    #[inline]
    pub(crate) fn set_last_get(&self, req: i64) {
        self.last_get_req.store(req, Ordering::Release);
    }

    /// Base of the payload data buffer.
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    pub fn sender_flags(&self) -> u32 {
        self.sender_flags.load(Ordering::Acquire)
    }

    pub fn set_sender_flags(&self, flags: u32) {
        self.sender_flags.store(flags, Ordering::Release);
    }

    pub fn receiver_flags(&self) -> u32 {
        self.receiver_flags.load(Ordering::Acquire)
    }

    pub fn set_receiver_flags(&self, flags: u32) {
        self.receiver_flags.store(flags, Ordering::Release);
    }

    /// Heap-backed queue for in-process tests.
    #[cfg(test)]
    pub(crate) fn new_boxed() -> Box<Self> {
        // Zeroed atomics are valid; init() fixes the counters.
        let tq: Box<Self> = unsafe { Box::new_zeroed().assume_init() };
        tq.init();
        tq
    }
}
