//! Error types for Channel Access operations.

use thiserror::Error;

use crate::provider::CaStatus;

/// Failure of a Channel Access operation.
///
/// Every variant that concerns a single PV carries its name, so a failure
/// surfaced from a batch operation still identifies the channel at fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaError {
    /// A wait on the PV exceeded its deadline.
    #[error("{pv}: operation timed out")]
    Timedout {
        /// Name of the PV the operation addressed.
        pv: String,
    },

    /// The operation found the channel not connected.
    #[error("{pv}: channel disconnected")]
    Disconnected {
        /// Name of the PV the operation addressed.
        pv: String,
    },

    /// A native Channel Access call returned a non-normal status.
    #[error("{function} failed: {}", .status.message())]
    Ca {
        /// Name of the native function that failed.
        function: &'static str,
        /// The status it reported.
        status: CaStatus,
    },

    /// A raw value buffer could not be decoded into a typed value.
    #[error("{pv}: malformed value: {reason}")]
    Decode {
        /// Name of the PV the value belongs to.
        pv: String,
        /// What was wrong with the buffer.
        reason: String,
    },
}

impl CaError {
    /// Translate a non-normal native status into the matching error for
    /// `pv`, attributing opaque statuses to `function`.
    pub(crate) fn from_status(pv: &str, function: &'static str, status: CaStatus) -> Self {
        match status {
            CaStatus::Timeout => Self::Timedout { pv: pv.to_string() },
            CaStatus::Disconnected => Self::Disconnected { pv: pv.to_string() },
            _ => Self::Ca { function, status },
        }
    }

    /// The PV this error concerns, when it names one.
    pub fn pv(&self) -> Option<&str> {
        match self {
            Self::Timedout { pv } | Self::Disconnected { pv } | Self::Decode { pv, .. } => {
                Some(pv)
            }
            Self::Ca { .. } => None,
        }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timedout { .. })
    }

    /// Whether this error reports a disconnected channel.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

/// A specialized Result type for Channel Access operations.
pub type CaResult<T> = std::result::Result<T, CaError>;
