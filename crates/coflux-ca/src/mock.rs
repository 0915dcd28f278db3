//! In-process fake Channel Access server for tests.
//!
//! Implements the [`ChannelAccess`] contract against a table of scripted
//! PVs: channels connect when their PV exists and is marked up, gets read
//! the stored value, puts write it back (write-then-read consistent), and
//! monitors receive an initial update plus whatever the test pushes.
//! Connection transitions and updates can also be driven from a separate
//! thread to exercise the provider-thread marshalling paths.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dbr::{self, Alarm, ArrayData, DbrCode, Format, Timestamp};
use crate::provider::{
    CaStatus, ChannelAccess, ChannelHandle, ChannelState, CompletionCallback, ConnectCallback,
    ConnectOp, DataUpdate, EventMask, MonitorCallback, MonitorHandle,
};

pub(crate) struct MockPv {
    data: ArrayData,
    connected: bool,
    ever_connected: bool,
    /// Gets on this PV never complete; used for timeout tests.
    silent_gets: bool,
    enum_strings: Vec<String>,
}

struct MockChannel {
    pv: String,
    on_connect: ConnectCallback,
}

struct MockMonitor {
    pv: String,
    code: DbrCode,
    count: usize,
    on_update: MonitorCallback,
}

#[derive(Default)]
struct MockState {
    pvs: HashMap<String, MockPv>,
    channels: HashMap<u64, MockChannel>,
    monitors: HashMap<u64, MockMonitor>,
    next_handle: u64,
    flush_count: usize,
}

/// Scripted fake CA library.
#[derive(Default)]
pub(crate) struct MockCa {
    state: Mutex<MockState>,
}

impl MockCa {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a PV that is immediately connected.
    pub(crate) fn add_pv(&self, name: &str, data: ArrayData) {
        self.insert_pv(name, data, true);
    }

    /// Register a PV that exists but is not yet connected.
    pub(crate) fn add_disconnected_pv(&self, name: &str, data: ArrayData) {
        self.insert_pv(name, data, false);
    }

    fn insert_pv(&self, name: &str, data: ArrayData, connected: bool) {
        let mut state = self.state.lock();
        state.pvs.insert(
            name.to_string(),
            MockPv {
                data,
                connected,
                ever_connected: connected,
                silent_gets: false,
                enum_strings: Vec::new(),
            },
        );
        drop(state);
        if connected {
            self.fire_connect(name, ConnectOp::Up);
        }
    }

    /// Bring a PV up or down, notifying every channel attached to it.
    pub(crate) fn set_connected(&self, name: &str, connected: bool) {
        {
            let mut state = self.state.lock();
            if let Some(pv) = state.pvs.get_mut(name) {
                pv.connected = connected;
                pv.ever_connected |= connected;
            }
        }
        let op = if connected {
            ConnectOp::Up
        } else {
            ConnectOp::Down
        };
        self.fire_connect(name, op);
    }

    fn fire_connect(&self, name: &str, op: ConnectOp) {
        let state = self.state.lock();
        for channel in state.channels.values() {
            if channel.pv == name {
                (channel.on_connect)(op);
            }
        }
    }

    /// Overwrite a PV's value without notifying monitors.
    pub(crate) fn set_value(&self, name: &str, data: ArrayData) {
        self.state.lock().pvs.get_mut(name).unwrap().data = data;
    }

    /// Current stored value of a PV.
    pub(crate) fn value(&self, name: &str) -> ArrayData {
        self.state.lock().pvs.get(name).unwrap().data.clone()
    }

    /// Make gets on a PV hang forever.
    pub(crate) fn silence_gets(&self, name: &str) {
        self.state.lock().pvs.get_mut(name).unwrap().silent_gets = true;
    }

    /// Send one update carrying the PV's current value to each of its
    /// monitors.
    pub(crate) fn push_update(&self, name: &str) {
        let state = self.state.lock();
        let Some(pv) = state.pvs.get(name) else { return };
        for monitor in state.monitors.values() {
            if monitor.pv == name {
                let update = encode_current(pv, monitor.code, monitor.count);
                (monitor.on_update)(update);
            }
        }
    }

    /// How many times `flush_io` has been called.
    pub(crate) fn flush_count(&self) -> usize {
        self.state.lock().flush_count
    }

    /// Number of live native channels.
    pub(crate) fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Number of live native subscriptions.
    pub(crate) fn monitor_count(&self) -> usize {
        self.state.lock().monitors.len()
    }
}

/// Encode a PV's current value the way a server would answer a request
/// for `code` with `count` elements (0 meaning the full length).
fn encode_current(pv: &MockPv, code: DbrCode, count: usize) -> DataUpdate {
    let data = pv
        .data
        .convert_to(code.basic)
        .expect("mock value convertible to requested type");
    let count = if count == 0 {
        data.len()
    } else {
        count.min(data.len())
    };
    let data = truncate(&data, count);
    let bytes = dbr::encode_update(
        code,
        &data,
        Some(Timestamp {
            secs: 1_600_000_000,
            nanos: 0,
        }),
        Some(Alarm {
            status: 0,
            severity: 0,
        }),
        &pv.enum_strings,
    );
    DataUpdate {
        code,
        count,
        bytes,
        status: CaStatus::Normal,
    }
}

fn truncate(data: &ArrayData, count: usize) -> ArrayData {
    match data {
        ArrayData::String(v) => ArrayData::String(v[..count].to_vec()),
        ArrayData::Short(v) => ArrayData::Short(v[..count].to_vec()),
        ArrayData::Float(v) => ArrayData::Float(v[..count].to_vec()),
        ArrayData::Enum(v) => ArrayData::Enum(v[..count].to_vec()),
        ArrayData::Char(v) => ArrayData::Char(v[..count].to_vec()),
        ArrayData::Long(v) => ArrayData::Long(v[..count].to_vec()),
        ArrayData::Double(v) => ArrayData::Double(v[..count].to_vec()),
    }
}

impl ChannelAccess for MockCa {
    fn create_channel(
        &self,
        name: &str,
        on_connect: ConnectCallback,
    ) -> Result<ChannelHandle, CaStatus> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = ChannelHandle(state.next_handle);
        let connected = state.pvs.get(name).is_some_and(|pv| pv.connected);
        state.channels.insert(
            handle.0,
            MockChannel {
                pv: name.to_string(),
                on_connect,
            },
        );
        if connected {
            (state.channels[&handle.0].on_connect)(ConnectOp::Up);
        }
        Ok(handle)
    }

    fn clear_channel(&self, channel: ChannelHandle) {
        self.state.lock().channels.remove(&channel.0);
    }

    fn element_count(&self, channel: ChannelHandle) -> usize {
        let state = self.state.lock();
        state
            .channels
            .get(&channel.0)
            .and_then(|ch| state.pvs.get(&ch.pv))
            .map_or(0, |pv| pv.data.len())
    }

    fn field_type(&self, channel: ChannelHandle) -> crate::dbr::BasicType {
        let state = self.state.lock();
        state
            .channels
            .get(&channel.0)
            .and_then(|ch| state.pvs.get(&ch.pv))
            .map_or(crate::dbr::BasicType::Double, |pv| pv.data.basic_type())
    }

    fn host_name(&self, _channel: ChannelHandle) -> String {
        "mockhost:5064".to_string()
    }

    fn state(&self, channel: ChannelHandle) -> ChannelState {
        let state = self.state.lock();
        let Some(pv) = state
            .channels
            .get(&channel.0)
            .and_then(|ch| state.pvs.get(&ch.pv))
        else {
            return ChannelState::NeverConnected;
        };
        if pv.connected {
            ChannelState::Connected
        } else if pv.ever_connected {
            ChannelState::PreviouslyConnected
        } else {
            ChannelState::NeverConnected
        }
    }

    fn read_access(&self, _channel: ChannelHandle) -> bool {
        true
    }

    fn write_access(&self, _channel: ChannelHandle) -> bool {
        true
    }

    fn get_with_callback(
        &self,
        channel: ChannelHandle,
        code: DbrCode,
        count: usize,
        done: CompletionCallback,
    ) -> Result<(), CaStatus> {
        let state = self.state.lock();
        let Some(pv) = state
            .channels
            .get(&channel.0)
            .and_then(|ch| state.pvs.get(&ch.pv))
        else {
            return Err(CaStatus::Disconnected);
        };
        if !pv.connected {
            return Err(CaStatus::Disconnected);
        }
        if pv.silent_gets {
            // Drop the completion: the request never finishes.
            return Ok(());
        }
        let update = encode_current(pv, code, count);
        drop(state);
        done(update);
        Ok(())
    }

    fn put(
        &self,
        channel: ChannelHandle,
        datatype: crate::dbr::BasicType,
        count: usize,
        bytes: &[u8],
    ) -> Result<(), CaStatus> {
        self.store(channel, datatype, count, bytes)
    }

    fn put_with_callback(
        &self,
        channel: ChannelHandle,
        datatype: crate::dbr::BasicType,
        count: usize,
        bytes: &[u8],
        done: CompletionCallback,
    ) -> Result<(), CaStatus> {
        let code = DbrCode {
            basic: datatype,
            format: Format::Raw,
        };
        self.store(channel, datatype, count, bytes)?;
        done(DataUpdate {
            code,
            count,
            bytes: Vec::new(),
            status: CaStatus::Normal,
        });
        Ok(())
    }

    fn create_subscription(
        &self,
        channel: ChannelHandle,
        code: DbrCode,
        count: usize,
        _mask: EventMask,
        on_update: MonitorCallback,
    ) -> Result<MonitorHandle, CaStatus> {
        let mut state = self.state.lock();
        let Some(pv_name) = state.channels.get(&channel.0).map(|ch| ch.pv.clone()) else {
            return Err(CaStatus::Disconnected);
        };
        state.next_handle += 1;
        let handle = MonitorHandle(state.next_handle);

        // Servers send the current value as the first update.
        if let Some(pv) = state.pvs.get(&pv_name) {
            if pv.connected {
                let update = encode_current(pv, code, count);
                on_update(update);
            }
        }
        state.monitors.insert(
            handle.0,
            MockMonitor {
                pv: pv_name,
                code,
                count,
                on_update,
            },
        );
        Ok(handle)
    }

    fn clear_subscription(&self, monitor: MonitorHandle) {
        self.state.lock().monitors.remove(&monitor.0);
    }

    fn flush_io(&self) {
        self.state.lock().flush_count += 1;
    }
}

impl MockCa {
    fn store(
        &self,
        channel: ChannelHandle,
        datatype: crate::dbr::BasicType,
        count: usize,
        bytes: &[u8],
    ) -> Result<(), CaStatus> {
        let update = DataUpdate {
            code: DbrCode {
                basic: datatype,
                format: Format::Raw,
            },
            count,
            bytes: bytes.to_vec(),
            status: CaStatus::Normal,
        };
        let written = dbr::decode("mock", &update).map_err(|_| CaStatus::Other(-1))?;

        let mut state = self.state.lock();
        let Some(pv_name) = state.channels.get(&channel.0).map(|ch| ch.pv.clone()) else {
            return Err(CaStatus::Disconnected);
        };
        let Some(pv) = state.pvs.get_mut(&pv_name) else {
            return Err(CaStatus::Disconnected);
        };
        if !pv.connected {
            return Err(CaStatus::Disconnected);
        }
        pv.data = written.data;
        Ok(())
    }
}
