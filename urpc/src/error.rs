//! Error types for the urpc transport.

use std::fmt;
use std::io;

/// Transport operation errors.
#[derive(Debug)]
pub enum Error {
    /// OS call failed (shared memory, fork, exec, signal).
    Os(io::Error),
    /// Per-process peer ceiling reached.
    PeerLimit,
    /// Payload arena allocation did not succeed within the timeout.
    AllocTimeout,
    /// The next mailbox slot stayed busy past the timeout.
    PutTimeout,
    /// DMA transfer returned a non-zero status.
    Dma(i32),
    /// Handler registration with an out-of-range id or a collision.
    HandlerSlot(u16),
    /// Command id does not fit the mailbox command field.
    BadCommand(u16),
    /// A 64-bit or buffer field would start off an 8-byte boundary.
    Misaligned(usize),
    /// Unpack cursor ran past the payload length.
    Truncated,
    /// Attached segment is smaller than the peer layout requires.
    SegmentSize { have: usize, need: usize },
    /// Forking the child process failed with the given errno.
    ChildSpawn(i32),
    /// No child process is recorded for this peer.
    NoChild,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(e) => write!(f, "OS error: {}", e),
            Error::PeerLimit => write!(f, "maximum number of live peers reached"),
            Error::AllocTimeout => write!(f, "payload allocation timed out"),
            Error::PutTimeout => write!(f, "mailbox slot stayed busy past the timeout"),
            Error::Dma(rc) => write!(f, "DMA transfer failed: {:#x}", rc),
            Error::HandlerSlot(cmd) => write!(f, "handler slot {} invalid or occupied", cmd),
            Error::BadCommand(cmd) => write!(f, "command id {} out of range", cmd),
            Error::Misaligned(pos) => {
                write!(f, "64-bit field at payload offset {} is not 8-byte aligned", pos)
            }
            Error::Truncated => write!(f, "payload ended before the format was exhausted"),
            Error::SegmentSize { have, need } => {
                write!(f, "segment too small: {} bytes, need {}", have, need)
            }
            Error::ChildSpawn(errno) => write!(f, "fork failed: errno {}", errno),
            Error::NoChild => write!(f, "no child process recorded"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Os(e)
    }
}

impl Error {
    /// Capture `errno` after a failed libc call.
    pub(crate) fn last_os() -> Self {
        Error::Os(io::Error::last_os_error())
    }

    /// The `-errno` style code host utilities report, when one applies.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Os(e) => e.raw_os_error().map(|c| -c),
            Error::ChildSpawn(errno) => Some(-errno),
            _ => None,
        }
    }
}

/// Result type for urpc operations.
pub type Result<T> = std::result::Result<T, Error>;
