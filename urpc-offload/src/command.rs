//! Command objects queued on a context.
//!
//! A command pairs a caller-assigned request id with a *submit* closure,
//! run when the command is popped from the request queue, and optionally a
//! *result* closure, run when the matching reply arrives. Host-only
//! commands carry a single local closure instead and double as fences
//! against in-flight remote work.

use urpc::{Mailbox, Peer};

/// Identifier the caller uses to wait for a command.
pub type RequestId = u64;

/// Returned by the `call_*` family when submission fails.
pub const REQUEST_ID_INVALID: RequestId = u64::MAX;

/// Outcome of a command as seen by `peek_result`/`wait_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The call finished and produced a return value.
    Ok,
    /// The call finished with an exception on the remote side.
    Exception,
    /// The command was cancelled or failed inside the dispatcher.
    Error,
    /// No reply yet.
    Unfinished,
}

/// Submit closure: issue the remote command. Returns the transport request
/// id, or a negative code when submission failed.
pub(crate) type SubmitFn = Box<dyn FnOnce(&Peer) -> Result<i64, i32> + Send>;

/// Result closure: consume the reply mailbox and payload. `Ok(retval)`
/// completes the command; `Err(retval)` marks it as an exception, which the
/// pump treats as fatal for the context.
pub(crate) type ResultFn = Box<dyn FnOnce(&Mailbox, &[u8]) -> Result<u64, u64> + Send>;

/// Host-only closure: runs locally once all in-flight work has drained.
pub(crate) type HostFn = Box<dyn FnOnce() -> u64 + Send>;

pub(crate) enum Work {
    Remote(SubmitFn),
    Host(HostFn),
}

pub(crate) struct Command {
    pub id: RequestId,
    /// Taken when the command is executed by the pump.
    pub work: Option<Work>,
    /// Taken when the matching reply arrives.
    pub on_result: Option<ResultFn>,
    pub retval: u64,
    pub status: CommandStatus,
}

impl Command {
    pub(crate) fn remote(id: RequestId, submit: SubmitFn, on_result: Option<ResultFn>) -> Self {
        Command {
            id,
            work: Some(Work::Remote(submit)),
            on_result,
            retval: 0,
            status: CommandStatus::Unfinished,
        }
    }

    pub(crate) fn host(id: RequestId, run: HostFn) -> Self {
        Command {
            id,
            work: Some(Work::Host(run)),
            on_result: None,
            retval: 0,
            status: CommandStatus::Unfinished,
        }
    }

    pub(crate) fn is_host(&self) -> bool {
        matches!(self.work, Some(Work::Host(_)))
    }

    pub(crate) fn set_result(&mut self, retval: u64, status: CommandStatus) {
        self.retval = retval;
        self.status = status;
    }
}

/// Owned argument list for a remote call, mirroring the payload field set.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    fields: Vec<ArgValue>,
}

#[derive(Debug, Clone)]
enum ArgValue {
    U32(u32),
    U64(u64),
    Pad,
    Bytes(Vec<u8>),
}

impl CallArgs {
    pub fn new() -> Self {
        CallArgs { fields: Vec::new() }
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.fields.push(ArgValue::U32(v));
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.fields.push(ArgValue::U64(v));
        self
    }

    pub fn pad(mut self) -> Self {
        self.fields.push(ArgValue::Pad);
        self
    }

    pub fn bytes(mut self, b: Vec<u8>) -> Self {
        self.fields.push(ArgValue::Bytes(b));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn as_fields(&self) -> Vec<urpc::Field<'_>> {
        self.fields
            .iter()
            .map(|f| match f {
                ArgValue::U32(v) => urpc::Field::U32(*v),
                ArgValue::U64(v) => urpc::Field::U64(*v),
                ArgValue::Pad => urpc::Field::Pad,
                ArgValue::Bytes(b) => urpc::Field::Bytes(b),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_args_preserve_order_and_content() {
        let args = CallArgs::new().u32(1).pad().u64(2).bytes(vec![3, 4]);
        let fields = args.as_fields();
        assert_eq!(fields.len(), 4);
        assert_eq!(urpc::packed_size(&fields), 4 + 4 + 8 + 8 + 2 + 6);
    }

    #[test]
    fn command_starts_unfinished() {
        let cmd = Command::host(7, Box::new(|| 0));
        assert_eq!(cmd.status, CommandStatus::Unfinished);
        assert!(cmd.is_host());
    }
}
