//! Timeout encoding shared by every bounded wait in the runtime.
//!
//! A [`Timeout`] is accepted as a relative duration, an absolute deadline,
//! or "wait forever". Resolving it to a deadline once, up front, lets a
//! sequence of waits share a single time budget instead of restarting the
//! clock at each suspension point.

use std::time::{Duration, Instant};

/// Bound on a cooperative wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// No bound: the wait only completes when its event fires.
    Forever,
    /// Expire after the given duration, measured from the call site.
    After(Duration),
    /// Expire at the given instant.
    At(Instant),
}

impl Timeout {
    /// Resolve to an absolute deadline, or `None` for an unbounded wait.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::After(duration) => Some(Instant::now() + duration),
            Self::At(instant) => Some(instant),
        }
    }

    /// An already-expired timeout, for non-blocking attempts.
    pub fn immediate() -> Self {
        Self::At(Instant::now())
    }

    /// Rebuild a timeout from an already-resolved deadline, so nested waits
    /// can share the outer budget.
    pub fn from_deadline(deadline: Option<Instant>) -> Self {
        match deadline {
            Some(instant) => Self::At(instant),
            None => Self::Forever,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Instant> for Timeout {
    fn from(instant: Instant) -> Self {
        Self::At(instant)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        match duration {
            Some(duration) => Self::After(duration),
            None => Self::Forever,
        }
    }
}
