//! The native Channel Access library boundary.
//!
//! The client layer is generic over a [`ChannelAccess`] provider: an
//! external library that speaks the CA wire protocol and offers
//! non-blocking channel, get/put and subscription primitives whose
//! completion callbacks arrive on threads the provider owns. Nothing in
//! this crate touches scheduler state from those callbacks; everything is
//! marshalled back through the thread bridge.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::dbr::{BasicType, DbrCode};

/// Opaque handle to a native channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Opaque handle to a native subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(pub u64);

/// Status code reported by native Channel Access calls and completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaStatus {
    /// The operation completed normally.
    Normal,
    /// The operation timed out inside the native library.
    Timeout,
    /// The channel is disconnected.
    Disconnected,
    /// Any other native status, carried opaquely.
    Other(i32),
}

impl CaStatus {
    /// Whether this status reports success.
    pub fn is_normal(self) -> bool {
        self == Self::Normal
    }

    /// Human-readable description of the status.
    pub fn message(self) -> String {
        match self {
            Self::Normal => "Normal successful completion".to_string(),
            Self::Timeout => "User specified timeout on IO operation expired".to_string(),
            Self::Disconnected => "Virtual circuit disconnect".to_string(),
            Self::Other(code) => format!("Channel access status code {code}"),
        }
    }
}

impl fmt::Display for CaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Connection transition reported by the native connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOp {
    /// The channel came up.
    Up,
    /// The channel went down.
    Down,
}

/// Lifetime state of a native channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The server has never been found.
    NeverConnected,
    /// Connected once, currently down.
    PreviouslyConnected,
    /// Currently connected.
    Connected,
    /// The channel has been closed.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverConnected => write!(f, "never connected"),
            Self::PreviouslyConnected => write!(f, "previously connected"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Bitmask selecting which PV changes a subscription is notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// Notify normal value changes.
    pub const VALUE: Self = Self(0x01);
    /// Notify archive value changes.
    pub const LOG: Self = Self(0x02);
    /// Notify alarm state changes.
    pub const ALARM: Self = Self(0x04);
    /// Notify property changes.
    pub const PROPERTY: Self = Self(0x08);

    /// The empty mask.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether any event in `other` is also selected here.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Payload of a native completion or monitor callback: the raw value
/// buffer together with the type code, element count and status.
#[derive(Debug, Clone)]
pub struct DataUpdate {
    /// Wire representation the buffer is encoded in.
    pub code: DbrCode,
    /// Number of elements in the buffer.
    pub count: usize,
    /// The raw value buffer.
    pub bytes: Vec<u8>,
    /// Status of the operation that produced this update.
    pub status: CaStatus,
}

/// Connection callback: invoked on a provider thread for every connection
/// transition of a channel.
pub type ConnectCallback = Box<dyn Fn(ConnectOp) + Send + Sync + 'static>;

/// One-shot completion callback for a get or put request.
pub type CompletionCallback = Box<dyn FnOnce(DataUpdate) + Send + 'static>;

/// Repeated update callback for a subscription.
pub type MonitorCallback = Box<dyn Fn(DataUpdate) + Send + Sync + 'static>;

/// Contract the native Channel Access library must satisfy.
///
/// All callbacks may be delivered on provider-owned threads, concurrently
/// with calls made into the provider from the scheduler thread.
pub trait ChannelAccess: Send + Sync {
    /// Create a channel for `name`. `on_connect` fires on every connection
    /// transition until the channel is cleared.
    fn create_channel(
        &self,
        name: &str,
        on_connect: ConnectCallback,
    ) -> Result<ChannelHandle, CaStatus>;

    /// Destroy a channel and drop its callbacks.
    fn clear_channel(&self, channel: ChannelHandle);

    /// Native element count of the channel; 0 while disconnected.
    fn element_count(&self, channel: ChannelHandle) -> usize;

    /// Native field type of the channel.
    fn field_type(&self, channel: ChannelHandle) -> BasicType;

    /// Host name and port of the server providing the channel.
    fn host_name(&self, channel: ChannelHandle) -> String;

    /// Current lifetime state of the channel.
    fn state(&self, channel: ChannelHandle) -> ChannelState;

    /// Whether the channel grants read access.
    fn read_access(&self, channel: ChannelHandle) -> bool;

    /// Whether the channel grants write access.
    fn write_access(&self, channel: ChannelHandle) -> bool;

    /// Issue a non-blocking read; `done` fires exactly once with the
    /// result.
    fn get_with_callback(
        &self,
        channel: ChannelHandle,
        code: DbrCode,
        count: usize,
        done: CompletionCallback,
    ) -> Result<(), CaStatus>;

    /// Fire-and-forget write.
    fn put(
        &self,
        channel: ChannelHandle,
        datatype: BasicType,
        count: usize,
        bytes: &[u8],
    ) -> Result<(), CaStatus>;

    /// Write with server acknowledgement; `done` fires exactly once.
    fn put_with_callback(
        &self,
        channel: ChannelHandle,
        datatype: BasicType,
        count: usize,
        bytes: &[u8],
        done: CompletionCallback,
    ) -> Result<(), CaStatus>;

    /// Create a long-lived subscription; `on_update` fires for every
    /// matching change until the subscription is cleared.
    fn create_subscription(
        &self,
        channel: ChannelHandle,
        code: DbrCode,
        count: usize,
        mask: EventMask,
        on_update: MonitorCallback,
    ) -> Result<MonitorHandle, CaStatus>;

    /// Destroy a subscription and drop its callback.
    fn clear_subscription(&self, monitor: MonitorHandle);

    /// Send all buffered requests to their servers.
    fn flush_io(&self);
}
