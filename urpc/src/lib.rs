//! urpc - micro-RPC transport over a single shared-memory segment.
//!
//! Two cooperating processes on heterogeneous processors (a host and an
//! accelerator) exchange short command mailboxes and variable-length
//! payloads with bounded latency and no kernel involvement on the hot path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────── host process ───────────┐   ┌──── accelerator process ────┐
//! │ Supervisor                          │   │                             │
//! │   └─ Peer ──┬─ send transfer_queue ─┼───┼─▶ recv side of remote Peer  │
//! │             │    (mailbox ring +    │   │     handlers, progress      │
//! │             │     payload arena)    │   │                             │
//! │             └─ recv transfer_queue ◀┼───┼── send side of remote Peer  │
//! └─────────────────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! - One segment of `2 * URPC_BUFF_LEN` bytes holds both directions; the
//!   attacher sees the halves swapped.
//! - Each direction is a single-producer/single-consumer mailbox ring with
//!   monotonically increasing request ids plus a wrap-around payload arena.
//! - The host spawns the remote process and hands the segment id over
//!   through the environment (`URPC_SHM_SEGID`).
//! - On the accelerator side payloads move through mirror buffers driven by
//!   an injected [`DmaEngine`]; payloads of at most 16 bytes take an inline
//!   copy path instead.
//!
//! The crate is organized as follows:
//!
//! - [`layout`]: compile-time constants, mailbox word, transfer queue
//! - [`codec`]: typed payload pack/unpack
//! - [`arena`]: producer-side payload arena
//! - [`ring`]: mailbox ring operations
//! - [`shm`]: System V segment wrapper
//! - [`dma`]: injected DMA capability and mirror buffers
//! - [`peer`]: peer object, handler registry, progress functions
//! - [`process`]: host-side supervisor

pub mod arena;
pub mod codec;
pub mod dma;
pub mod error;
pub mod layout;
pub mod peer;
pub mod process;
pub mod ring;
pub mod shm;

pub use codec::{pack, packed_size, Field, Unpacker};
pub use dma::{DmaEngine, MemcpyDma};
pub use error::{Error, Result};
pub use layout::{
    Mailbox, TransferQueue, INLINE_PAYLOAD_MAX, URPC_ALLOC_TIMEOUT_US, URPC_BUFF_LEN,
    URPC_CMD_NONE, URPC_DATA_BUFF_LEN, URPC_DELAY_PEEK_US, URPC_LEN_MB, URPC_MAX_HANDLERS,
    URPC_MAX_PEERS, URPC_PUT_TIMEOUT_US,
};
pub use peer::{Handler, Peer, PeerConfig, Queue, ENV_SHM_SEGID};
pub use process::{Supervisor, ENV_BIN_OVERRIDE, ENV_CORE, ENV_NODE_NUMBER};
pub use shm::SharedSegment;
