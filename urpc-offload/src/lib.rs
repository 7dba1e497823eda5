//! urpc-offload - asynchronous request/reply dispatching over the urpc
//! transport.
//!
//! A [`Context`] wraps one [`urpc::Peer`] and turns the raw mailbox
//! protocol into an asynchronous call API:
//!
//! ```ignore
//! let ctx = Context::new(peer);
//! let req = ctx.call_async_retval(CMD_ECHO, CallArgs::new().bytes(b"hi".to_vec()));
//! let (status, retval) = ctx.wait_result(req);
//! ```
//!
//! - Submissions from any thread land in a request FIFO.
//! - A single progress pump submits commands to the transport, tracks them
//!   in an in-flight FIFO, and matches replies back in order.
//! - Host-only commands act as local fences: they run once all in-flight
//!   remote work has drained.
//! - `close` cancels everything pending; waiters observe status `Error`.
//!
//! The crate is organized as follows:
//!
//! - [`command`]: command objects and owned call arguments
//! - `comq`: the request / in-flight / completion queues (internal)
//! - [`context`]: the context state machine and progress pump

mod comq;

pub mod command;
pub mod context;
pub mod error;

pub use command::{CallArgs, CommandStatus, RequestId, REQUEST_ID_INVALID};
pub use context::{Context, ContextState};
pub use error::{Error, Result};
