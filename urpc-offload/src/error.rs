//! Error types for the dispatcher.

use std::fmt;

/// Dispatcher errors. Most surface through command statuses; these are the
/// conditions the pump itself has to act on.
#[derive(Debug)]
pub enum Error {
    /// The context has transitioned to EXIT.
    Closed,
    /// A reply arrived while the in-flight queue was empty.
    ProtocolViolation(i64),
    /// A submit closure failed with the given code.
    SubmitFailed(i32),
    /// The transport reported an error.
    Transport(urpc::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "context is closed"),
            Error::ProtocolViolation(req) => {
                write!(f, "reply {} arrived with an empty in-flight queue", req)
            }
            Error::SubmitFailed(rc) => write!(f, "command submission failed: {}", rc),
            Error::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<urpc::Error> for Error {
    fn from(e: urpc::Error) -> Self {
        Error::Transport(e)
    }
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;
