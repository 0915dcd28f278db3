//! Per-PV channels and their connection state machine.
//!
//! A channel tracks one PV's connection to its server. Connection
//! transitions arrive on provider threads and are marshalled onto the
//! scheduler before any state changes; on the scheduler thread the channel
//! updates its flag, releases every task blocked in
//! [`Channel::wait_connected`] and notifies its attached subscriptions of
//! the transition, in order.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use coflux_core::{Pulse, ThreadedEventQueue, Timedout, Timeout};

use crate::client::CaEvent;
use crate::error::CaError;
use crate::provider::{ChannelAccess, ChannelHandle, ConnectCallback, ConnectOp};
use crate::subscription::SubscriptionInner;

pub(crate) struct Channel {
    name: String,
    handle: Cell<Option<ChannelHandle>>,
    connected: Cell<bool>,
    connect_pulse: Pulse,
    subscriptions: RefCell<Vec<Weak<SubscriptionInner>>>,
}

impl Channel {
    /// Create the native channel and start tracking its connection.
    pub(crate) fn open(
        name: &str,
        cid: u64,
        provider: &Arc<dyn ChannelAccess>,
        events: ThreadedEventQueue<CaEvent>,
    ) -> Result<Rc<Self>, CaError> {
        let on_connect: ConnectCallback = Box::new(move |op| {
            // Provider thread: hand the transition to the scheduler.
            let _ = events.signal(CaEvent::Connect { cid, op });
        });
        let handle = provider
            .create_channel(name, on_connect)
            .map_err(|status| CaError::Ca {
                function: "create_channel",
                status,
            })?;

        tracing::debug!(target: "coflux_ca::channel", pv = name, ?handle, "channel created");
        Ok(Rc::new(Self {
            name: name.to_string(),
            handle: Cell::new(Some(handle)),
            connected: Cell::new(false),
            connect_pulse: Pulse::new(),
            subscriptions: RefCell::new(Vec::new()),
        }))
    }

    pub(crate) fn handle(&self) -> Option<ChannelHandle> {
        self.handle.get()
    }

    /// Apply a connection transition. Scheduler thread only.
    pub(crate) fn on_connect(&self, op: ConnectOp) {
        let connected = op == ConnectOp::Up;
        tracing::debug!(
            target: "coflux_ca::channel",
            pv = self.name.as_str(),
            connected,
            "connection transition"
        );
        self.connected.set(connected);
        if connected {
            self.connect_pulse.signal();
        }

        // Notify attached subscriptions, dropping the ones that are gone.
        let subscribers: Vec<Rc<SubscriptionInner>> = {
            let mut subscriptions = self.subscriptions.borrow_mut();
            subscriptions.retain(|weak| weak.upgrade().is_some());
            subscriptions.iter().filter_map(Weak::upgrade).collect()
        };
        for subscription in subscribers {
            subscription.on_channel_connect(connected);
        }
    }

    /// Wait until the channel is connected, failing with a PV-named
    /// timeout at the deadline.
    pub(crate) async fn wait_connected(&self, deadline: Option<Instant>) -> Result<(), CaError> {
        while !self.connected.get() {
            self.connect_pulse
                .wait(Timeout::from_deadline(deadline))
                .await
                .map_err(|_| CaError::Timedout {
                    pv: self.name.clone(),
                })?;
        }
        Ok(())
    }

    /// Wait for a connection or any poke of the channel's pulse. Returns
    /// whether the channel is connected; a timeout is reported as an error
    /// so the caller can tell it apart from a deliberate wake.
    pub(crate) async fn wakeable_wait(&self, deadline: Option<Instant>) -> Result<bool, Timedout> {
        if !self.connected.get() {
            self.connect_pulse
                .wait(Timeout::from_deadline(deadline))
                .await?;
        }
        Ok(self.connected.get())
    }

    /// Wake everything blocked on the connection pulse without changing
    /// state.
    pub(crate) fn poke(&self) {
        self.connect_pulse.signal();
    }

    pub(crate) fn add_subscription(&self, subscription: &Rc<SubscriptionInner>) {
        self.subscriptions
            .borrow_mut()
            .push(Rc::downgrade(subscription));
    }

    pub(crate) fn remove_subscription(&self, subscription: &Rc<SubscriptionInner>) {
        self.subscriptions.borrow_mut().retain(|weak| {
            weak.upgrade()
                .is_some_and(|other| !Rc::ptr_eq(&other, subscription))
        });
    }

    /// Forcible close: shut down attached subscriptions, then clear the
    /// native channel. Used at client shutdown.
    pub(crate) fn purge(&self, provider: &Arc<dyn ChannelAccess>) {
        let subscribers: Vec<Rc<SubscriptionInner>> =
            self.subscriptions.borrow().iter().filter_map(Weak::upgrade).collect();
        for subscription in subscribers {
            subscription.close();
        }
        self.subscriptions.borrow_mut().clear();
        if let Some(handle) = self.handle.take() {
            provider.clear_channel(handle);
        }
        self.connected.set(false);
    }
}
