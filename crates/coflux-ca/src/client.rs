//! The Channel Access client: channel cache, one-shot get/put, monitors
//! and connection info.
//!
//! A [`CaClient`] lives on the scheduler thread and owns the channel
//! cache, the tables of in-flight get/put requests, and three background
//! tasks:
//!
//! - the *event dispatcher*, draining provider-thread completions and
//!   connection transitions into scheduler-side state;
//! - the *monitor dispatcher*, delivering subscription updates to user
//!   callbacks;
//! - the *flush coalescer*, which turns any burst of get/put/subscribe
//!   requests issued in one scheduler tick into a single native
//!   `flush_io` call.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use coflux_core::thread_check::ThreadAffinity;
use coflux_core::{Event, ThreadedEventQueue, Timedout, Timeout, spawn};
use slotmap::{SlotMap, new_key_type};

use crate::channel::Channel;
use crate::dbr::{self, BasicType, CaValue, Format, PutValue};
use crate::error::{CaError, CaResult};
use crate::provider::{
    CaStatus, ChannelAccess, ChannelState, CompletionCallback, ConnectOp, DataUpdate, EventMask,
};
use crate::subscription::{
    MonitorValueCallback, Subscription, SubscriptionInner, default_events, open_subscription,
};

/// Default operation timeout, matching the native tools.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

new_key_type! {
    pub(crate) struct GetKey;
    pub(crate) struct PutKey;
}

/// Element-count request for reads and monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Count {
    /// Let the server choose (typically the full, data-dependent length).
    #[default]
    Native,
    /// Request the channel's full element count.
    Full,
    /// Request at most this many elements, clamped to the channel size.
    Max(usize),
}

impl Count {
    pub(crate) fn resolve(self, native: usize) -> usize {
        match self {
            Self::Native => 0,
            Self::Full => native,
            Self::Max(count) => count.min(native),
        }
    }
}

/// Options for [`CaClient::caget`].
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Overall deadline for connection plus data transfer.
    pub timeout: Timeout,
    /// Requested datatype; `None` asks for the channel's native type.
    pub datatype: Option<BasicType>,
    /// How much auxiliary information to fetch.
    pub format: Format,
    /// Element count request.
    pub count: Count,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            timeout: Timeout::After(DEFAULT_TIMEOUT),
            datatype: None,
            format: Format::Raw,
            count: Count::Native,
        }
    }
}

/// Options for [`CaClient::caput`].
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Overall deadline for connection plus (when waiting) completion.
    pub timeout: Timeout,
    /// Wait for the server to acknowledge the write.
    pub wait: bool,
    /// Coerce the value to this datatype before transmission.
    pub datatype: Option<BasicType>,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            timeout: Timeout::After(DEFAULT_TIMEOUT),
            wait: false,
            datatype: None,
        }
    }
}

/// Options for [`CaClient::camonitor`].
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Event mask; `None` derives a default from `format`.
    pub events: Option<EventMask>,
    /// Requested datatype; `None` asks for the channel's native type.
    pub datatype: Option<BasicType>,
    /// How much auxiliary information each update carries.
    pub format: Format,
    /// Element count request.
    pub count: Count,
    /// Deliver every native update instead of coalescing to the latest.
    pub all_updates: bool,
    /// Report connection loss to the callback as an error value.
    pub notify_disconnect: bool,
    /// Surface one disconnect event if connection takes longer than this;
    /// the subscription then keeps waiting indefinitely.
    pub connect_timeout: Timeout,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            events: None,
            datatype: None,
            format: Format::Raw,
            count: Count::Native,
            all_updates: false,
            notify_disconnect: false,
            connect_timeout: Timeout::Forever,
        }
    }
}

/// Connection snapshot returned by [`CaClient::cainfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaInfo {
    /// Name of the PV.
    pub name: String,
    /// Lifetime state of the channel.
    pub state: ChannelState,
    /// Host name and port of the serving IOC.
    pub host: String,
    /// Whether the channel grants read access.
    pub read: bool,
    /// Whether the channel grants write access.
    pub write: bool,
    /// Native element count; 0 while disconnected.
    pub count: usize,
    /// Native datatype; `None` while disconnected.
    pub datatype: Option<BasicType>,
}

impl fmt::Display for CaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datatype = match self.datatype {
            Some(datatype) => datatype.to_string(),
            None => "no access".to_string(),
        };
        write!(
            f,
            "{}:\n    State: {}\n    Host: {}\n    Access: {}, {}\n    Data type: {}\n    Count: {}",
            self.name, self.state, self.host, self.read, self.write, datatype, self.count
        )
    }
}

/// Marshalled provider-thread event.
pub(crate) enum CaEvent {
    /// Connection transition of the channel with the given cache id.
    Connect { cid: u64, op: ConnectOp },
    /// A get completed (value already decoded on the provider thread).
    GetDone {
        key: GetKey,
        value: Box<CaResult<CaValue>>,
    },
    /// A put-with-callback completed.
    PutDone { key: PutKey, status: CaStatus },
}

/// One dispatched monitor delivery.
pub(crate) enum Delivery {
    /// Deliver this value as-is (`update_count == 1`).
    Direct(Box<CaResult<CaValue>>),
    /// Deliver the latest merged value from the subscription's cell.
    Merged,
}

pub(crate) struct MonitorEvent {
    pub(crate) sid: u64,
    pub(crate) delivery: Delivery,
}

struct GetWaiter {
    done: Event<CaResult<CaValue>>,
}

struct PutWaiter {
    pv: String,
    done: Option<Event<CaResult<()>>>,
    callback: Option<Box<dyn FnOnce(CaResult<()>) + 'static>>,
}

pub(crate) struct ClientInner {
    pub(crate) provider: Arc<dyn ChannelAccess>,
    channels: RefCell<HashMap<String, Rc<Channel>>>,
    channels_by_id: RefCell<HashMap<u64, Rc<Channel>>>,
    next_cid: Cell<u64>,
    next_sid: Cell<u64>,
    pub(crate) subscriptions: RefCell<HashMap<u64, Rc<SubscriptionInner>>>,
    pending_gets: RefCell<SlotMap<GetKey, GetWaiter>>,
    pending_puts: RefCell<SlotMap<PutKey, PutWaiter>>,
    events: ThreadedEventQueue<CaEvent>,
    pub(crate) monitor_events: ThreadedEventQueue<MonitorEvent>,
    flush_event: Event<()>,
    closed: Cell<bool>,
    affinity: ThreadAffinity,
}

impl ClientInner {
    /// Ask the flush coalescer to issue one `flush_io`.
    pub(crate) fn request_flush(&self) {
        self.flush_event.signal(());
    }

    /// Channel cache lookup; a miss creates and registers the channel.
    fn channel(self: &Rc<Self>, pv: &str) -> CaResult<Rc<Channel>> {
        if let Some(channel) = self.channels.borrow().get(pv) {
            return Ok(channel.clone());
        }
        let cid = self.next_cid.get();
        self.next_cid.set(cid + 1);
        let channel = Channel::open(pv, cid, &self.provider, self.events.clone())?;
        self.channels
            .borrow_mut()
            .insert(pv.to_string(), channel.clone());
        self.channels_by_id.borrow_mut().insert(cid, channel.clone());
        self.request_flush();
        Ok(channel)
    }

    fn handle_event(self: &Rc<Self>, event: CaEvent) {
        match event {
            CaEvent::Connect { cid, op } => {
                let channel = self.channels_by_id.borrow().get(&cid).cloned();
                if let Some(channel) = channel {
                    channel.on_connect(op);
                }
            }
            CaEvent::GetDone { key, value } => {
                if let Some(waiter) = self.pending_gets.borrow_mut().remove(key) {
                    waiter.done.signal(*value);
                }
            }
            CaEvent::PutDone { key, status } => {
                let waiter = self.pending_puts.borrow_mut().remove(key);
                if let Some(waiter) = waiter {
                    let result = if status.is_normal() {
                        Ok(())
                    } else {
                        Err(CaError::from_status(
                            &waiter.pv,
                            "array_put_callback",
                            status,
                        ))
                    };
                    if let Some(done) = waiter.done {
                        done.signal(result.clone());
                    }
                    if let Some(callback) = waiter.callback {
                        callback(result);
                    }
                }
            }
        }
    }
}

async fn run_event_dispatcher(events: ThreadedEventQueue<CaEvent>, client: Weak<ClientInner>) {
    while let Ok(event) = events.wait().await {
        let Some(client) = client.upgrade() else {
            return;
        };
        client.handle_event(event);
    }
}

async fn run_monitor_dispatcher(
    events: ThreadedEventQueue<MonitorEvent>,
    client: Weak<ClientInner>,
) {
    while let Ok(event) = events.wait().await {
        let Some(client) = client.upgrade() else {
            return;
        };
        let subscription = client.subscriptions.borrow().get(&event.sid).cloned();
        if let Some(subscription) = subscription {
            subscription.deliver(event.delivery);
        }
    }
}

async fn run_flusher(flush: Event<()>, client: Weak<ClientInner>) {
    loop {
        if flush.wait(Timeout::Forever).await.is_err() {
            return;
        }
        let Some(client) = client.upgrade() else {
            return;
        };
        if client.closed.get() {
            return;
        }
        tracing::trace!(target: "coflux_ca::client", "flushing native IO");
        client.provider.flush_io();
    }
}

/// Channel Access client handle. Cheap to clone; all clones share one
/// channel cache and dispatcher set.
#[derive(Clone)]
pub struct CaClient {
    inner: Rc<ClientInner>,
}

impl CaClient {
    /// Create a client over the given provider and start its background
    /// tasks. Must be called from a task on a running scheduler.
    pub fn new(provider: Arc<dyn ChannelAccess>) -> coflux_core::Result<Self> {
        let events = ThreadedEventQueue::new()?;
        let monitor_events = ThreadedEventQueue::new()?;
        let inner = Rc::new(ClientInner {
            provider,
            channels: RefCell::new(HashMap::new()),
            channels_by_id: RefCell::new(HashMap::new()),
            next_cid: Cell::new(0),
            next_sid: Cell::new(0),
            subscriptions: RefCell::new(HashMap::new()),
            pending_gets: RefCell::new(SlotMap::with_key()),
            pending_puts: RefCell::new(SlotMap::with_key()),
            events: events.clone(),
            monitor_events: monitor_events.clone(),
            flush_event: Event::new(),
            closed: Cell::new(false),
            affinity: ThreadAffinity::current(),
        });

        spawn(run_event_dispatcher(events, Rc::downgrade(&inner))).detach();
        spawn(run_monitor_dispatcher(monitor_events, Rc::downgrade(&inner))).detach();
        spawn(run_flusher(inner.flush_event.clone(), Rc::downgrade(&inner))).detach();

        Ok(Self { inner })
    }

    /// Read one PV, waiting for connection and data within the timeout.
    pub async fn caget(&self, pv: &str, options: GetOptions) -> CaResult<CaValue> {
        self.inner.affinity.debug_assert_same_thread();
        let deadline = options.timeout.deadline();
        let channel = self.inner.channel(pv)?;
        channel.wait_connected(deadline).await?;
        let handle = channel.handle().ok_or_else(|| CaError::Disconnected {
            pv: pv.to_string(),
        })?;

        let native_count = self.inner.provider.element_count(handle);
        let count = options.count.resolve(native_count);
        let native_type = self.inner.provider.field_type(handle);
        let code = dbr::request_code(native_type, options.datatype, options.format);

        let done = Event::new();
        let key = self
            .inner
            .pending_gets
            .borrow_mut()
            .insert(GetWaiter { done: done.clone() });

        let events = self.inner.events.clone();
        let name = pv.to_string();
        let completion: CompletionCallback = Box::new(move |update: DataUpdate| {
            // Provider thread: decode here, marshal the result across.
            let value = if update.status.is_normal() {
                dbr::decode(&name, &update)
            } else {
                Err(CaError::from_status(&name, "array_get_callback", update.status))
            };
            let _ = events.signal(CaEvent::GetDone {
                key,
                value: Box::new(value),
            });
        });

        if let Err(status) = self
            .inner
            .provider
            .get_with_callback(handle, code, count, completion)
        {
            self.inner.pending_gets.borrow_mut().remove(key);
            return Err(CaError::from_status(pv, "array_get_callback", status));
        }
        self.inner.request_flush();

        match done.wait(Timeout::from_deadline(deadline)).await {
            Ok(result) => result,
            Err(Timedout) => {
                // Invalidate the request so a late completion is a no-op.
                self.inner.pending_gets.borrow_mut().remove(key);
                Err(CaError::Timedout { pv: pv.to_string() })
            }
        }
    }

    /// Read several PVs in parallel, one spawned task per PV. Each element
    /// of the result reports its own PV's outcome.
    pub async fn caget_many(&self, pvs: &[&str], options: GetOptions) -> Vec<CaResult<CaValue>> {
        let tasks: Vec<_> = pvs
            .iter()
            .map(|pv| {
                let client = self.clone();
                let pv = pv.to_string();
                let options = options.clone();
                spawn(async move { client.caget(&pv, options).await })
            })
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.join().await);
        }
        results
    }

    /// Write one PV. With `wait` set, blocks until the server acknowledges
    /// the write.
    pub async fn caput(
        &self,
        pv: &str,
        value: impl Into<PutValue>,
        options: PutOptions,
    ) -> CaResult<()> {
        self.put_inner(pv, value.into(), options, None).await
    }

    /// Write one PV and invoke `callback` with the completion status once
    /// the server acknowledges, independently of `options.wait`.
    pub async fn caput_with_callback(
        &self,
        pv: &str,
        value: impl Into<PutValue>,
        options: PutOptions,
        callback: impl FnOnce(CaResult<()>) + 'static,
    ) -> CaResult<()> {
        self.put_inner(pv, value.into(), options, Some(Box::new(callback)))
            .await
    }

    async fn put_inner(
        &self,
        pv: &str,
        value: PutValue,
        options: PutOptions,
        callback: Option<Box<dyn FnOnce(CaResult<()>) + 'static>>,
    ) -> CaResult<()> {
        self.inner.affinity.debug_assert_same_thread();
        let deadline = options.timeout.deadline();
        let channel = self.inner.channel(pv)?;
        channel.wait_connected(deadline).await?;
        let handle = channel.handle().ok_or_else(|| CaError::Disconnected {
            pv: pv.to_string(),
        })?;

        let mut data = value.into_data();
        if let Some(datatype) = options.datatype {
            data = data.convert_to(datatype).map_err(|reason| CaError::Decode {
                pv: pv.to_string(),
                reason,
            })?;
        }
        let datatype = data.basic_type();
        let count = data.len();
        let bytes = dbr::encode_values(&data);

        if options.wait || callback.is_some() {
            let done = options.wait.then(Event::new);
            let key = self.inner.pending_puts.borrow_mut().insert(PutWaiter {
                pv: pv.to_string(),
                done: done.clone(),
                callback,
            });

            let events = self.inner.events.clone();
            let completion: CompletionCallback = Box::new(move |update: DataUpdate| {
                let _ = events.signal(CaEvent::PutDone {
                    key,
                    status: update.status,
                });
            });

            if let Err(status) =
                self.inner
                    .provider
                    .put_with_callback(handle, datatype, count, &bytes, completion)
            {
                self.inner.pending_puts.borrow_mut().remove(key);
                return Err(CaError::from_status(pv, "array_put_callback", status));
            }
            self.inner.request_flush();

            match done {
                Some(done) => match done.wait(Timeout::from_deadline(deadline)).await {
                    Ok(result) => result,
                    Err(Timedout) => {
                        // The request stays alive when a completion
                        // callback still wants the status; otherwise a
                        // late completion has nothing left to tell.
                        let mut puts = self.inner.pending_puts.borrow_mut();
                        if puts.get(key).is_some_and(|waiter| waiter.callback.is_none()) {
                            puts.remove(key);
                        }
                        Err(CaError::Timedout { pv: pv.to_string() })
                    }
                },
                None => Ok(()),
            }
        } else {
            self.inner
                .provider
                .put(handle, datatype, count, &bytes)
                .map_err(|status| CaError::from_status(pv, "array_put", status))?;
            self.inner.request_flush();
            Ok(())
        }
    }

    /// Write several PVs in parallel, pairing `pvs[i]` with `values[i]`.
    ///
    /// # Panics
    ///
    /// Panics if the two slices differ in length.
    pub async fn caput_many(
        &self,
        pvs: &[&str],
        values: Vec<PutValue>,
        options: PutOptions,
    ) -> Vec<CaResult<()>> {
        assert_eq!(
            pvs.len(),
            values.len(),
            "PV and value lists must match in length"
        );
        let tasks: Vec<_> = pvs
            .iter()
            .zip(values)
            .map(|(pv, value)| {
                let client = self.clone();
                let pv = pv.to_string();
                let options = options.clone();
                spawn(async move { client.put_inner(&pv, value, options, None).await })
            })
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.join().await);
        }
        results
    }

    /// Write the same value to several PVs in parallel.
    pub async fn caput_many_repeat(
        &self,
        pvs: &[&str],
        value: impl Into<PutValue>,
        options: PutOptions,
    ) -> Vec<CaResult<()>> {
        let value = value.into();
        let values = pvs.iter().map(|_| value.clone()).collect();
        self.caput_many(pvs, values, options).await
    }

    /// Subscribe to updates of one PV. Returns at once; connection and
    /// native registration happen in a helper task.
    pub fn camonitor(
        &self,
        pv: &str,
        callback: impl FnMut(CaResult<CaValue>) + 'static,
        options: MonitorOptions,
    ) -> CaResult<Subscription> {
        self.monitor_inner(pv, Box::new(callback), options)
    }

    /// Subscribe to several PVs; the callback also receives the index of
    /// the PV an update belongs to.
    pub fn camonitor_many(
        &self,
        pvs: &[&str],
        callback: impl FnMut(CaResult<CaValue>, usize) + Clone + 'static,
        options: MonitorOptions,
    ) -> CaResult<Vec<Subscription>> {
        pvs.iter()
            .enumerate()
            .map(|(index, pv)| {
                let mut callback = callback.clone();
                self.monitor_inner(
                    pv,
                    Box::new(move |value| callback(value, index)),
                    options.clone(),
                )
            })
            .collect()
    }

    fn monitor_inner(
        &self,
        pv: &str,
        callback: MonitorValueCallback,
        options: MonitorOptions,
    ) -> CaResult<Subscription> {
        self.inner.affinity.debug_assert_same_thread();
        let channel = self.inner.channel(pv)?;
        let sid = self.inner.next_sid.get();
        self.inner.next_sid.set(sid + 1);

        let inner = SubscriptionInner::new(
            pv.to_string(),
            sid,
            channel,
            callback,
            options.all_updates,
            options.notify_disconnect,
            &self.inner,
        );
        self.inner.subscriptions.borrow_mut().insert(sid, inner.clone());

        let events = options.events.unwrap_or_else(|| default_events(options.format));
        spawn(open_subscription(
            inner.clone(),
            events,
            options.datatype,
            options.format,
            options.count,
            options.connect_timeout.deadline(),
        ))
        .detach();

        Ok(Subscription::from_inner(inner))
    }

    /// Establish a connection to `pv`, waiting until it is up.
    pub async fn connect(&self, pv: &str, timeout: impl Into<Timeout>) -> CaResult<()> {
        let channel = self.inner.channel(pv)?;
        channel.wait_connected(timeout.into().deadline()).await
    }

    /// Queue a connection to `pv` without waiting for it.
    pub fn request_connect(&self, pv: &str) -> CaResult<()> {
        self.inner.channel(pv).map(|_| ())
    }

    /// Establish connections to several PVs in parallel, reporting each
    /// PV's outcome separately.
    pub async fn connect_many(
        &self,
        pvs: &[&str],
        timeout: impl Into<Timeout>,
    ) -> Vec<CaResult<()>> {
        let deadline = timeout.into().deadline();
        let tasks: Vec<_> = pvs
            .iter()
            .map(|pv| {
                let client = self.clone();
                let pv = pv.to_string();
                spawn(async move {
                    client.connect(&pv, Timeout::from_deadline(deadline)).await
                })
            })
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.join().await);
        }
        results
    }

    /// Wait for a connection and snapshot the channel's state.
    pub async fn cainfo(&self, pv: &str, timeout: impl Into<Timeout>) -> CaResult<CaInfo> {
        let channel = self.inner.channel(pv)?;
        channel.wait_connected(timeout.into().deadline()).await?;
        let handle = channel.handle().ok_or_else(|| CaError::Disconnected {
            pv: pv.to_string(),
        })?;

        let state = self.inner.provider.state(handle);
        let connected = state == ChannelState::Connected;
        Ok(CaInfo {
            name: pv.to_string(),
            state,
            host: self.inner.provider.host_name(handle),
            read: self.inner.provider.read_access(handle),
            write: self.inner.provider.write_access(handle),
            count: if connected {
                self.inner.provider.element_count(handle)
            } else {
                0
            },
            datatype: connected.then(|| self.inner.provider.field_type(handle)),
        })
    }

    /// Shut the client down: close every subscription, clear every native
    /// channel and stop the background tasks. Further operations on
    /// existing channels will fail.
    pub fn shutdown(&self) {
        self.inner.affinity.debug_assert_same_thread();
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::debug!(target: "coflux_ca::client", "client shutdown");
        let channels: Vec<Rc<Channel>> = self.inner.channels.borrow_mut().drain().map(|(_, channel)| channel).collect();
        for channel in &channels {
            channel.purge(&self.inner.provider);
        }
        self.inner.channels_by_id.borrow_mut().clear();
        self.inner.subscriptions.borrow_mut().clear();
        self.inner.events.close();
        self.inner.monitor_events.close();
        // Wake the flusher so it observes the closed flag and exits.
        self.inner.request_flush();
        self.inner.provider.flush_io();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCa;
    use coflux_core::{Scheduler, sleep};

    fn provider(mock: &Arc<MockCa>) -> Arc<dyn ChannelAccess> {
        mock.clone()
    }

    #[test]
    fn test_caput_then_caget_round_trip() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:LONG", crate::dbr::ArrayData::Long(vec![0]));
        let provider = provider(&mock);

        let value = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caput(
                    "TEST:LONG",
                    42i32,
                    PutOptions {
                        wait: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            client.caget("TEST:LONG", GetOptions::default()).await.unwrap()
        });

        assert_eq!(value.name, "TEST:LONG");
        assert_eq!(value.as_i64(), Some(42));
        assert_eq!(value.update_count, 1);
    }

    #[test]
    fn test_caget_zero_timeout_on_unconnected_pv() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_disconnected_pv("TEST:SLOW", crate::dbr::ArrayData::Double(vec![1.0]));
        let provider = provider(&mock);

        let result = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caget(
                    "TEST:SLOW",
                    GetOptions {
                        timeout: Timeout::immediate(),
                        ..Default::default()
                    },
                )
                .await
        });
        assert_eq!(
            result,
            Err(CaError::Timedout {
                pv: "TEST:SLOW".to_string()
            })
        );
    }

    #[test]
    fn test_caget_waits_for_cross_thread_connection() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_disconnected_pv("TEST:LATE", crate::dbr::ArrayData::Long(vec![5]));
        let provider = provider(&mock);

        let remote = mock.clone();
        let value = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            std::thread::spawn(move || {
                // Connection arrives from a library thread.
                std::thread::sleep(Duration::from_millis(20));
                remote.set_connected("TEST:LATE", true);
            });
            client
                .caget(
                    "TEST:LATE",
                    GetOptions {
                        timeout: Timeout::After(Duration::from_secs(2)),
                        ..Default::default()
                    },
                )
                .await
        });
        assert_eq!(value.unwrap().as_i64(), Some(5));
    }

    #[test]
    fn test_caget_many_reports_per_pv_outcomes() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:GOOD", crate::dbr::ArrayData::Double(vec![2.5]));
        let provider = provider(&mock);

        let results = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caget_many(
                    &["TEST:GOOD", "TEST:BOGUS"],
                    GetOptions {
                        timeout: Timeout::After(Duration::from_millis(50)),
                        ..Default::default()
                    },
                )
                .await
        });

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().as_f64(), Some(2.5));
        assert!(results[1].as_ref().is_err_and(CaError::is_timeout));
    }

    #[test]
    fn test_caget_time_format_carries_metadata() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:TIMED", crate::dbr::ArrayData::Double(vec![9.0]));
        let provider = provider(&mock);

        let value = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caget(
                    "TEST:TIMED",
                    GetOptions {
                        format: Format::Time,
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        });
        assert!(value.timestamp.is_some());
        assert!(value.alarm.is_some());
    }

    #[test]
    fn test_caput_coerces_requested_datatype() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:COERCE", crate::dbr::ArrayData::Long(vec![0]));
        let provider = provider(&mock);

        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caput(
                    "TEST:COERCE",
                    3.7f64,
                    PutOptions {
                        wait: true,
                        datatype: Some(BasicType::Long),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        });
        assert_eq!(mock.value("TEST:COERCE"), crate::dbr::ArrayData::Long(vec![3]));
    }

    #[test]
    fn test_caput_many_length_mismatch_panics() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        let provider = provider(&mock);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.run(async move {
                let client = CaClient::new(provider).unwrap();
                client
                    .caput_many(&["A", "B"], vec![PutValue::from(1i32)], PutOptions::default())
                    .await
            });
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_caput_many_repeat_writes_all() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:R1", crate::dbr::ArrayData::Long(vec![0]));
        mock.add_pv("TEST:R2", crate::dbr::ArrayData::Long(vec![0]));
        let provider = provider(&mock);

        let results = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client
                .caput_many_repeat(
                    &["TEST:R1", "TEST:R2"],
                    7i32,
                    PutOptions {
                        wait: true,
                        ..Default::default()
                    },
                )
                .await
        });
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(mock.value("TEST:R1"), crate::dbr::ArrayData::Long(vec![7]));
        assert_eq!(mock.value("TEST:R2"), crate::dbr::ArrayData::Long(vec![7]));
    }

    #[test]
    fn test_monitor_all_updates_delivers_each() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:MON", crate::dbr::ArrayData::Long(vec![1]));
        let provider = provider(&mock);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mock_inside = mock.clone();
        let seen_result = seen.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sink = seen_result.clone();
            let _sub = client
                .camonitor(
                    "TEST:MON",
                    move |value| {
                        let value = value.unwrap();
                        sink.borrow_mut().push((value.as_i64().unwrap(), value.update_count));
                    },
                    MonitorOptions {
                        all_updates: true,
                        ..Default::default()
                    },
                )
                .unwrap();

            // Initial update from the server.
            sleep(Duration::from_millis(20)).await;
            mock_inside.set_value("TEST:MON", crate::dbr::ArrayData::Long(vec![2]));
            mock_inside.push_update("TEST:MON");
            mock_inside.set_value("TEST:MON", crate::dbr::ArrayData::Long(vec![3]));
            mock_inside.push_update("TEST:MON");
            sleep(Duration::from_millis(20)).await;
        });

        assert_eq!(*seen.borrow(), vec![(1, 1), (2, 1), (3, 1)]);
    }

    #[test]
    fn test_monitor_coalesces_burst_into_one_delivery() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:BURST", crate::dbr::ArrayData::Long(vec![0]));
        let provider = provider(&mock);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mock_inside = mock.clone();
        let seen_result = seen.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sink = seen_result.clone();
            let _sub = client
                .camonitor(
                    "TEST:BURST",
                    move |value| {
                        let value = value.unwrap();
                        sink.borrow_mut().push((value.as_i64().unwrap(), value.update_count));
                    },
                    MonitorOptions::default(),
                )
                .unwrap();
            sleep(Duration::from_millis(20)).await;

            // Ten updates land while the dispatcher never gets a turn;
            // they must coalesce into one delivery of the latest value.
            for n in 1..=10 {
                mock_inside.set_value("TEST:BURST", crate::dbr::ArrayData::Long(vec![n]));
                mock_inside.push_update("TEST:BURST");
            }
            sleep(Duration::from_millis(20)).await;
        });

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2, "initial delivery plus one coalesced: {seen:?}");
        assert_eq!(seen[0], (0, 1));
        assert_eq!(seen[1], (10, 10));
    }

    #[test]
    fn test_monitor_notify_disconnect_reports_loss() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:DROP", crate::dbr::ArrayData::Long(vec![4]));
        let provider = provider(&mock);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mock_inside = mock.clone();
        let seen_result = seen.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sink = seen_result.clone();
            let _sub = client
                .camonitor(
                    "TEST:DROP",
                    move |value| {
                        sink.borrow_mut().push(value.map(|v| v.as_i64().unwrap()));
                    },
                    MonitorOptions {
                        notify_disconnect: true,
                        ..Default::default()
                    },
                )
                .unwrap();
            sleep(Duration::from_millis(20)).await;
            mock_inside.set_connected("TEST:DROP", false);
            sleep(Duration::from_millis(20)).await;
        });

        let seen = seen.borrow();
        assert_eq!(seen[0], Ok(4));
        assert_eq!(
            seen[1],
            Err(CaError::Disconnected {
                pv: "TEST:DROP".to_string()
            })
        );
    }

    #[test]
    fn test_monitor_on_missing_pv_stays_opening_until_closed() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        let provider = provider(&mock);

        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sub = client
                .camonitor("TEST:NOWHERE", |_| {}, MonitorOptions::default())
                .unwrap();
            sleep(Duration::from_millis(30)).await;
            assert!(!sub.is_open());
            assert!(!sub.is_closed());

            sub.close();
            sleep(Duration::from_millis(30)).await;
            assert!(sub.is_closed());
        });
        assert_eq!(mock.monitor_count(), 0);
    }

    #[test]
    fn test_monitor_connect_timeout_surfaces_one_event_then_connects() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        let provider = provider(&mock);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mock_inside = mock.clone();
        let seen_result = seen.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sink = seen_result.clone();
            let _sub = client
                .camonitor(
                    "TEST:EVENTUAL",
                    move |value| {
                        sink.borrow_mut().push(value.map(|v| v.as_i64().unwrap()));
                    },
                    MonitorOptions {
                        connect_timeout: Timeout::After(Duration::from_millis(20)),
                        ..Default::default()
                    },
                )
                .unwrap();

            // The connect timeout must surface a disconnect event even
            // though notify_disconnect is off.
            sleep(Duration::from_millis(60)).await;
            mock_inside.add_pv("TEST:EVENTUAL", crate::dbr::ArrayData::Long(vec![8]));
            sleep(Duration::from_millis(60)).await;
        });

        let seen = seen.borrow();
        assert_eq!(
            seen.first(),
            Some(&Err(CaError::Disconnected {
                pv: "TEST:EVENTUAL".to_string()
            }))
        );
        assert_eq!(seen.last(), Some(&Ok(8)));
    }

    #[test]
    fn test_monitor_callback_panic_closes_subscription() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:FAULTY", crate::dbr::ArrayData::Long(vec![1]));
        let provider = provider(&mock);

        let calls = Rc::new(Cell::new(0));
        let mock_inside = mock.clone();
        let calls_result = calls.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let counter = calls_result.clone();
            let sub = client
                .camonitor(
                    "TEST:FAULTY",
                    move |_| {
                        counter.set(counter.get() + 1);
                        panic!("user callback failure");
                    },
                    MonitorOptions {
                        all_updates: true,
                        ..Default::default()
                    },
                )
                .unwrap();
            sleep(Duration::from_millis(20)).await;
            assert!(sub.is_closed());

            // Further updates must not reach the callback.
            mock_inside.push_update("TEST:FAULTY");
            sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_flush_coalescing_one_flush_per_burst() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:FLUSH", crate::dbr::ArrayData::Long(vec![0]));
        let provider = provider(&mock);

        let mock_inside = mock.clone();
        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            // Settle channel creation and its flush first.
            client
                .connect("TEST:FLUSH", Duration::from_secs(1))
                .await
                .unwrap();
            sleep(Duration::from_millis(20)).await;

            let before = mock_inside.flush_count();
            for n in 0..3i32 {
                client
                    .caput("TEST:FLUSH", n, PutOptions::default())
                    .await
                    .unwrap();
            }
            sleep(Duration::from_millis(20)).await;
            let after = mock_inside.flush_count();
            assert_eq!(after - before, 1, "a burst of puts must flush once");
        });
    }

    #[test]
    fn test_cainfo_snapshot() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:INFO", crate::dbr::ArrayData::Double(vec![1.0, 2.0, 3.0]));
        let provider = provider(&mock);

        let info = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            client.cainfo("TEST:INFO", Duration::from_secs(1)).await.unwrap()
        });

        assert_eq!(info.state, ChannelState::Connected);
        assert_eq!(info.host, "mockhost:5064");
        assert!(info.read && info.write);
        assert_eq!(info.count, 3);
        assert_eq!(info.datatype, Some(BasicType::Double));
        assert!(info.to_string().contains("Data type: double"));
    }

    #[test]
    fn test_count_clamped_to_native_length() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv(
            "TEST:WAVE",
            crate::dbr::ArrayData::Double(vec![1.0, 2.0, 3.0, 4.0]),
        );
        let provider = provider(&mock);

        let (clamped, full) = scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let clamped = client
                .caget(
                    "TEST:WAVE",
                    GetOptions {
                        count: Count::Max(2),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let full = client
                .caget(
                    "TEST:WAVE",
                    GetOptions {
                        count: Count::Full,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            (clamped, full)
        });
        assert_eq!(clamped.len(), 2);
        assert_eq!(full.len(), 4);
    }

    #[test]
    fn test_shutdown_purges_channels_and_monitors() {
        let scheduler = Scheduler::new().unwrap();
        let mock = MockCa::new();
        mock.add_pv("TEST:BYE", crate::dbr::ArrayData::Long(vec![1]));
        let provider = provider(&mock);

        scheduler.run(async move {
            let client = CaClient::new(provider).unwrap();
            let sub = client
                .camonitor("TEST:BYE", |_| {}, MonitorOptions::default())
                .unwrap();
            sleep(Duration::from_millis(20)).await;
            assert!(sub.is_open());

            client.shutdown();
            assert!(sub.is_closed());
            sleep(Duration::from_millis(20)).await;
        });

        assert_eq!(mock.channel_count(), 0);
        assert_eq!(mock.monitor_count(), 0);
    }
}
