//! Cooperative descriptor readiness polling.
//!
//! Tasks wait on file descriptors through a registry that the scheduler
//! consults each turn. Several tasks may watch the same descriptor with
//! different event masks; when the OS reports readiness, each event is
//! offered to interested pollers in registration order and *consumed* by
//! the first taker, so a single readiness report never wakes two readers
//! for the same data. Error-class events (`ERR`, `HUP`, `NVAL`) are
//! delivered to every listener without being consumed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::Timedout;
use crate::scheduler;
use crate::time::Timeout;
use crate::wakeup::{WakeReason, Wakeup};

/// Bitmask of descriptor readiness events.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PollEvents(u8);

impl PollEvents {
    /// Data ready to read.
    pub const IN: Self = Self(0x01);
    /// Urgent data ready to read.
    pub const PRI: Self = Self(0x02);
    /// Ready for writing.
    pub const OUT: Self = Self(0x04);
    /// Error condition on the descriptor.
    pub const ERR: Self = Self(0x08);
    /// Peer hung up.
    pub const HUP: Self = Self(0x10);
    /// The descriptor is not open.
    pub const NVAL: Self = Self(0x20);

    /// Events that indicate a descriptor problem. These are offered to all
    /// listeners and never consumed.
    pub const ERROR_EVENTS: Self = Self(0x08 | 0x10 | 0x20);

    /// The empty event set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether no events are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every event in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any event is shared with `other`.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        let mut events = Self::empty();
        if event.is_readable() {
            events |= Self::IN;
        }
        if event.is_priority() {
            events |= Self::PRI;
        }
        if event.is_writable() {
            events |= Self::OUT;
        }
        if event.is_error() {
            events |= Self::ERR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            events |= Self::HUP;
        }
        events
    }

    /// Translate to the OS poll interest set. Priority data is folded into
    /// the readable interest. Returns `None` for error-only masks, which
    /// every registration reports regardless.
    fn to_interest(self) -> Option<Interest> {
        let readable = self.intersects(Self::IN | Self::PRI);
        let writable = self.intersects(Self::OUT);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for PollEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollEvents {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PollEvents {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & 0x3f)
    }
}

impl fmt::Debug for PollEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::IN, "IN"),
            (Self::PRI, "PRI"),
            (Self::OUT, "OUT"),
            (Self::ERR, "ERR"),
            (Self::HUP, "HUP"),
            (Self::NVAL, "NVAL"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.intersects(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// One task's registration with the poll registry: what it wants per
/// descriptor, what has fired so far, and the wakeup that resumes it.
pub(crate) struct PollerShared {
    interests: HashMap<RawFd, PollEvents>,
    ready: RefCell<HashMap<RawFd, PollEvents>>,
    wakeup: Wakeup,
}

impl PollerShared {
    /// Offer `events` on `fd` to this poller. Accepted events are
    /// accumulated and the task woken; the returned mask is what this
    /// poller consumed (error events are accepted but never consumed).
    fn notify(&self, fd: RawFd, events: PollEvents) -> PollEvents {
        let Some(&interest) = self.interests.get(&fd) else {
            return PollEvents::empty();
        };
        let offered = events & (interest | PollEvents::ERROR_EVENTS);
        if !offered.is_empty() {
            *self.ready.borrow_mut().entry(fd).or_default() |= offered;
            self.wakeup.fire(WakeReason::Normal);
        }
        offered & !PollEvents::ERROR_EVENTS
    }
}

/// Map from descriptor to the pollers interested in it, kept in
/// registration order, plus the mirror of what is currently registered
/// with the OS poll.
pub(crate) struct PollRegistry {
    pollers: HashMap<RawFd, Vec<Rc<PollerShared>>>,
    registered: HashMap<RawFd, Interest>,
}

impl PollRegistry {
    pub(crate) fn new() -> Self {
        Self {
            pollers: HashMap::new(),
            registered: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, poller: &Rc<PollerShared>) {
        for &fd in poller.interests.keys() {
            self.pollers.entry(fd).or_default().push(poller.clone());
        }
    }

    /// Recompute the live poll list for this turn, pruning pollers whose
    /// wakeup has been spent, and (when driving the OS poll ourselves)
    /// bring the OS registrations in line with it.
    pub(crate) fn prepare(&mut self, registry: Option<&mio::Registry>) -> Vec<(RawFd, PollEvents)> {
        let mut poll_list = Vec::new();
        self.pollers.retain(|&fd, pollers| {
            pollers.retain(|poller| !poller.wakeup.is_spent());
            if pollers.is_empty() {
                return false;
            }
            let mut mask = PollEvents::empty();
            for poller in pollers.iter() {
                mask |= poller.interests[&fd];
            }
            poll_list.push((fd, mask));
            true
        });
        if let Some(registry) = registry {
            self.sync(registry, &poll_list);
        }
        poll_list
    }

    /// Distribute one descriptor's readiness to its pollers, applying the
    /// consumption rule.
    pub(crate) fn distribute(&mut self, fd: RawFd, events: PollEvents) {
        tracing::trace!(target: "coflux_core::poller", fd, ?events, "readiness");
        let Some(pollers) = self.pollers.get(&fd) else {
            return;
        };
        let mut remaining = events;
        for poller in pollers {
            if remaining.is_empty() {
                break;
            }
            let consumed = poller.notify(fd, remaining);
            remaining = remaining & !consumed;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pollers.clear();
        self.registered.clear();
    }

    fn sync(&mut self, registry: &mio::Registry, poll_list: &[(RawFd, PollEvents)]) {
        let mut desired = HashMap::new();
        let mut invalid = Vec::new();
        for &(fd, mask) in poll_list {
            if let Some(interest) = mask.to_interest() {
                desired.insert(fd, interest);
            }
        }

        self.registered.retain(|&fd, _| {
            if desired.contains_key(&fd) {
                true
            } else {
                let _ = registry.deregister(&mut SourceFd(&fd));
                false
            }
        });

        for (&fd, &interest) in &desired {
            // Re-register live descriptors every turn: edge-triggered
            // backends re-report current readiness on rearm, so readiness
            // left unconsumed by one poller reaches the next.
            let result = if self.registered.contains_key(&fd) {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            } else {
                registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
            };
            match result {
                Ok(()) => {
                    self.registered.insert(fd, interest);
                }
                Err(err) => {
                    tracing::debug!(
                        target: "coflux_core::poller",
                        fd, %err,
                        "descriptor rejected by OS poll"
                    );
                    self.registered.remove(&fd);
                    invalid.push(fd);
                }
            }
        }

        for fd in invalid {
            self.distribute(fd, PollEvents::NVAL);
        }
    }
}

/// Cooperatively wait until any of the given descriptors signals a selected
/// event, or an error-class event, or the timeout expires.
///
/// Returns the `(descriptor, events)` pairs that fired. Duplicate
/// descriptors in the interest list are merged.
pub async fn poll_list(
    interests: &[(RawFd, PollEvents)],
    timeout: impl Into<Timeout>,
) -> std::result::Result<Vec<(RawFd, PollEvents)>, Timedout> {
    let mut merged: HashMap<RawFd, PollEvents> = HashMap::new();
    for &(fd, events) in interests {
        *merged.entry(fd).or_default() |= events;
    }
    PollFuture {
        interests: merged,
        deadline: timeout.into().deadline(),
        poller: None,
        finished: false,
    }
    .await
}

/// Wait for readiness on a single descriptor.
pub async fn poll_one(
    fd: RawFd,
    events: PollEvents,
    timeout: impl Into<Timeout>,
) -> std::result::Result<PollEvents, Timedout> {
    let fired = poll_list(&[(fd, events)], timeout).await?;
    let mut result = PollEvents::empty();
    for (_, events) in fired {
        result |= events;
    }
    Ok(result)
}

struct PollFuture {
    interests: HashMap<RawFd, PollEvents>,
    deadline: Option<Instant>,
    poller: Option<Rc<PollerShared>>,
    finished: bool,
}

impl Future for PollFuture {
    type Output = std::result::Result<Vec<(RawFd, PollEvents)>, Timedout>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(poller) = &this.poller {
            return match poller.wakeup.fired_reason() {
                None => {
                    poller.wakeup.update_waker(cx.waker());
                    Poll::Pending
                }
                Some(WakeReason::Normal) => {
                    this.finished = true;
                    let mut fired: Vec<(RawFd, PollEvents)> =
                        poller.ready.borrow_mut().drain().collect();
                    fired.sort_by_key(|&(fd, _)| fd);
                    Poll::Ready(Ok(fired))
                }
                Some(WakeReason::Timeout) => {
                    this.finished = true;
                    Poll::Ready(Err(Timedout))
                }
                Some(WakeReason::Abandoned) => unreachable!("abandoned poller polled"),
            };
        }

        // An exhausted budget fails fast without touching the registry.
        if this.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            this.finished = true;
            return Poll::Ready(Err(Timedout));
        }

        let poller = Rc::new(PollerShared {
            interests: std::mem::take(&mut this.interests),
            ready: RefCell::new(HashMap::new()),
            wakeup: Wakeup::new(cx.waker().clone()),
        });
        scheduler::add_poller(&poller);
        if let Some(deadline) = this.deadline {
            scheduler::register_timer(deadline, poller.wakeup.clone());
        }
        this.poller = Some(poller);
        Poll::Pending
    }
}

impl Drop for PollFuture {
    fn drop(&mut self) {
        let Some(poller) = &self.poller else { return };
        if !self.finished && poller.wakeup.fired_reason().is_none() {
            poller.wakeup.fire(WakeReason::Abandoned);
        }
    }
}
