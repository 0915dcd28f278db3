//! Long-lived monitors with optional update coalescing.
//!
//! Creating a subscription returns immediately; a helper task waits for
//! the channel to connect (surfacing a connect-timeout event if asked to)
//! and then registers the native subscription. Updates arrive on provider
//! threads, are decoded there, and reach the user callback through the
//! client's monitor dispatcher on the scheduler thread — either one
//! delivery per native update, or coalesced to the latest value with a
//! count of how many updates it stands for.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coflux_core::{Timedout, sleep, spawn};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::client::{ClientInner, Count, Delivery, MonitorEvent};
use crate::dbr::{self, CaValue, Format};
use crate::error::CaError;
use crate::provider::{DataUpdate, EventMask, MonitorCallback};

/// Callback invoked with each delivered monitor value.
pub type MonitorValueCallback = Box<dyn FnMut(Result<CaValue, CaError>) + 'static>;

/// Default event mask for a subscription, derived from the requested
/// format: the more auxiliary data is asked for, the more changes are of
/// interest.
pub(crate) fn default_events(format: Format) -> EventMask {
    match format {
        Format::Raw => EventMask::VALUE,
        Format::Time => EventMask::VALUE | EventMask::ALARM,
        Format::Ctrl => EventMask::VALUE | EventMask::ALARM | EventMask::PROPERTY,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubState {
    /// Waiting for the channel; no native subscription yet.
    Opening,
    /// Native subscription active.
    Open,
    /// Closed; no further callbacks will be delivered.
    Closed,
}

/// Latest-value cell shared with the provider-thread update callback.
pub(crate) struct MergeCell {
    value: Option<Result<CaValue, CaError>>,
    pending: u32,
}

pub(crate) struct SubscriptionInner {
    name: String,
    sid: u64,
    state: Cell<SubState>,
    channel: Rc<Channel>,
    handle: Cell<Option<crate::provider::MonitorHandle>>,
    callback: RefCell<Option<MonitorValueCallback>>,
    all_updates: bool,
    notify_disconnect: bool,
    merge: Arc<Mutex<MergeCell>>,
    client: Weak<ClientInner>,
}

impl SubscriptionInner {
    pub(crate) fn new(
        name: String,
        sid: u64,
        channel: Rc<Channel>,
        callback: MonitorValueCallback,
        all_updates: bool,
        notify_disconnect: bool,
        client: &Rc<ClientInner>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name,
            sid,
            state: Cell::new(SubState::Opening),
            channel,
            handle: Cell::new(None),
            callback: RefCell::new(Some(callback)),
            all_updates,
            notify_disconnect,
            merge: Arc::new(Mutex::new(MergeCell {
                value: None,
                pending: 0,
            })),
            client: Rc::downgrade(client),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.get() == SubState::Open
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.get() == SubState::Closed
    }

    /// Channel connection transition, on the scheduler thread.
    pub(crate) fn on_channel_connect(&self, connected: bool) {
        if !connected && self.notify_disconnect {
            push_update(
                self.sid,
                self.all_updates,
                &self.merge,
                &|event| {
                    if let Some(client) = self.client.upgrade() {
                        let _ = client.monitor_events.signal(event);
                    }
                },
                Err(CaError::Disconnected {
                    pv: self.name.clone(),
                }),
            );
        }
    }

    /// Deliver one dispatched monitor event to the user callback.
    /// Scheduler thread only.
    pub(crate) fn deliver(self: &Rc<Self>, delivery: Delivery) {
        if self.state.get() == SubState::Closed {
            return;
        }
        let value = match delivery {
            Delivery::Direct(value) => *value,
            Delivery::Merged => {
                let mut cell = self.merge.lock();
                let Some(mut value) = cell.value.take() else {
                    return;
                };
                let count = cell.pending;
                cell.pending = 0;
                if let Ok(value) = &mut value {
                    value.update_count = count;
                }
                value
            }
        };

        // Take the callback out for the call so a reentrant close from
        // inside it cannot conflict with our borrow.
        let Some(mut callback) = self.callback.borrow_mut().take() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
            Ok(()) => {
                if self.state.get() != SubState::Closed {
                    *self.callback.borrow_mut() = Some(callback);
                }
            }
            Err(_) => {
                // A single failing callback must not turn into a storm.
                tracing::error!(
                    target: "coflux_ca::subscription",
                    pv = self.name.as_str(),
                    "monitor callback panicked; closing subscription"
                );
                self.close();
            }
        }
    }

    /// Close the subscription. Idempotent; scheduler thread only.
    pub(crate) fn close(self: &Rc<Self>) {
        match self.state.get() {
            SubState::Closed => return,
            SubState::Opening => {
                // Wake the helper task; it observes the state and returns.
                self.channel.poke();
            }
            SubState::Open => {
                self.channel.remove_subscription(self);
                if let Some(client) = self.client.upgrade() {
                    if let Some(handle) = self.handle.take() {
                        client.provider.clear_subscription(handle);
                        client.request_flush();
                    }
                }
            }
        }
        self.state.set(SubState::Closed);
        *self.callback.borrow_mut() = None;
        tracing::debug!(target: "coflux_ca::subscription", pv = self.name.as_str(), "closed");

        // Linger briefly before unregistering so in-flight deliveries that
        // still carry our id find a closed subscription instead of a
        // recycled one.
        if let Some(client) = self.client.upgrade() {
            let client = Rc::downgrade(&client);
            let sid = self.sid;
            spawn(async move {
                sleep(Duration::from_millis(100)).await;
                if let Some(client) = client.upgrade() {
                    client.subscriptions.borrow_mut().remove(&sid);
                }
            })
            .detach();
        }
    }
}

/// Route one update (or disconnect notification) toward the dispatcher:
/// direct deliveries carry the value itself, coalesced deliveries park it
/// in the merge cell and only post a token on the empty-to-pending edge.
/// Runs on provider threads and on the scheduler thread alike.
fn push_update(
    sid: u64,
    all_updates: bool,
    merge: &Arc<Mutex<MergeCell>>,
    post: &dyn Fn(MonitorEvent),
    value: Result<CaValue, CaError>,
) {
    // Decode failures bypass coalescing so they are never overwritten by a
    // later good value.
    let direct = all_updates || matches!(&value, Err(CaError::Decode { .. }));
    if direct {
        post(MonitorEvent {
            sid,
            delivery: Delivery::Direct(Box::new(value)),
        });
    } else {
        let mut cell = merge.lock();
        cell.value = Some(value);
        cell.pending += 1;
        if cell.pending == 1 {
            post(MonitorEvent {
                sid,
                delivery: Delivery::Merged,
            });
        }
    }
}

/// Build the provider-thread update callback for a subscription.
fn monitor_callback(inner: &Rc<SubscriptionInner>, client: &Rc<ClientInner>) -> MonitorCallback {
    let name = inner.name.clone();
    let sid = inner.sid;
    let all_updates = inner.all_updates;
    let notify_disconnect = inner.notify_disconnect;
    let merge = inner.merge.clone();
    let monitor_events = client.monitor_events.clone();

    Box::new(move |update: DataUpdate| {
        let value = if update.status.is_normal() {
            dbr::decode(&name, &update)
        } else if notify_disconnect {
            Err(CaError::Disconnected { pv: name.clone() })
        } else {
            return;
        };
        push_update(
            sid,
            all_updates,
            &merge,
            &|event| {
                let _ = monitor_events.signal(event);
            },
            value,
        );
    })
}

/// Helper task: wait for the channel, then create the native
/// subscription.
pub(crate) async fn open_subscription(
    inner: Rc<SubscriptionInner>,
    events: EventMask,
    datatype: Option<crate::dbr::BasicType>,
    format: Format,
    count: Count,
    connect_deadline: Option<Instant>,
) {
    if !wait_for_channel(&inner, connect_deadline).await {
        return;
    }
    let Some(client) = inner.client.upgrade() else {
        return;
    };
    let Some(handle) = inner.channel.handle() else {
        return;
    };

    inner.state.set(SubState::Open);
    inner.channel.add_subscription(&inner);

    let native_count = client.provider.element_count(handle);
    let count = count.resolve(native_count);
    let native_type = client.provider.field_type(handle);
    let code = dbr::request_code(native_type, datatype, format);

    let callback = monitor_callback(&inner, &client);
    match client
        .provider
        .create_subscription(handle, code, count, events, callback)
    {
        Ok(monitor) => {
            inner.handle.set(Some(monitor));
            client.request_flush();
            tracing::debug!(
                target: "coflux_ca::subscription",
                pv = inner.name.as_str(),
                ?code,
                "subscription open"
            );
        }
        Err(status) => {
            tracing::error!(
                target: "coflux_ca::subscription",
                pv = inner.name.as_str(),
                status = %status.message(),
                "create_subscription failed"
            );
            inner.channel.remove_subscription(&inner);
            inner.state.set(SubState::Closed);
            *inner.callback.borrow_mut() = None;
        }
    }
}

/// Wait until the channel connects, the subscription is closed, or — once,
/// at the connect deadline — a disconnect event has been surfaced, after
/// which the wait continues unbounded. Returns whether the subscription
/// should still be created.
async fn wait_for_channel(
    inner: &Rc<SubscriptionInner>,
    mut deadline: Option<Instant>,
) -> bool {
    while inner.state.get() == SubState::Opening {
        match inner.channel.wakeable_wait(deadline).await {
            Ok(true) => return inner.state.get() == SubState::Opening,
            Ok(false) => continue,
            Err(Timedout) => {
                // Connect timeout: let the subscriber know even when
                // disconnect notification is off, then keep waiting.
                push_update(
                    inner.sid,
                    inner.all_updates,
                    &inner.merge,
                    &|event| {
                        if let Some(client) = inner.client.upgrade() {
                            let _ = client.monitor_events.signal(event);
                        }
                    },
                    Err(CaError::Disconnected {
                        pv: inner.name.clone(),
                    }),
                );
                deadline = None;
            }
        }
    }
    false
}

/// Handle to an active monitor.
///
/// The subscription stays active until [`Subscription::close`] is called;
/// dropping the handle alone does not close it.
pub struct Subscription {
    inner: Rc<SubscriptionInner>,
}

impl Subscription {
    pub(crate) fn from_inner(inner: Rc<SubscriptionInner>) -> Self {
        Self { inner }
    }

    /// Name of the monitored PV.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether the native subscription has been established.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether the subscription has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the subscription: no further callbacks will be delivered, not
    /// even ones already queued for dispatch.
    pub fn close(&self) {
        self.inner.close();
    }
}
