//! Error types for the coflux runtime.

use std::fmt;
use std::io;

/// A cooperative wait ran past its deadline.
///
/// This is the sole cancellation mechanism in the runtime: every suspending
/// primitive that accepts a [`Timeout`](crate::Timeout) reports expiry by
/// returning this error to the suspended task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timedout;

impl fmt::Display for Timedout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation timed out")
    }
}

impl std::error::Error for Timedout {}

/// Error returned by a bounded wait on an event queue or channel-like object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The wait exceeded its deadline.
    Timedout,
    /// The queue has been closed and no further values will arrive.
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timedout => write!(f, "Wait timed out"),
            Self::Closed => write!(f, "Queue is closed"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<Timedout> for WaitError {
    fn from(_: Timedout) -> Self {
        Self::Timedout
    }
}

/// Error returned when a value cannot be pushed onto an event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// The queue is bounded and currently at capacity.
    Full,
    /// The queue has been closed.
    Closed,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "Queue is full"),
            Self::Closed => write!(f, "Queue is closed"),
        }
    }
}

impl std::error::Error for SignalError {}

/// Faults raised while constructing scheduler plumbing: the OS poll, a
/// wake pipe, or a bridge queue could not be created.
#[derive(Debug)]
pub enum CoreError {
    /// The OS readiness facility could not be created.
    Reactor(io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reactor(err) => write!(f, "Failed to create OS poll reactor: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reactor(err) => Some(err),
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        Self::Reactor(err)
    }
}

/// A specialized Result type for coflux runtime operations.
pub type Result<T> = std::result::Result<T, CoreError>;
