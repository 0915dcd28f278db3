//! One-shot wakeups and the wait queues that hold them.
//!
//! Every suspension in the runtime is mediated by a [`Wakeup`]: a one-shot
//! arbiter that ties a suspended task to the event source it is waiting on
//! and, optionally, to a deadline on the scheduler's timer queue. Whichever
//! side fires first consumes the wakeup; the loser finds it spent and leaves
//! it behind as garbage to be collected lazily by the queue that still holds
//! it. This is what guarantees at-most-one resumption per suspension even
//! when a wait is raced by its own timeout.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::error::Timedout;
use crate::scheduler;

/// Why a suspended task was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// The event the task was waiting for occurred.
    Normal,
    /// The associated deadline expired first.
    Timeout,
    /// The waiting future was dropped before either side fired.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeState {
    Armed,
    Fired(WakeReason),
}

/// A one-shot wakeup shared between a wait queue, the timer queue and the
/// suspended task's future.
#[derive(Clone)]
pub(crate) struct Wakeup {
    inner: Rc<WakeupInner>,
}

struct WakeupInner {
    waker: RefCell<Waker>,
    state: Cell<WakeState>,
    /// Queue this wakeup is enqueued on, if any. Used to credit that
    /// queue's garbage count when the timer side wins the race.
    wait_queue: RefCell<Option<Weak<WaitQueueInner>>>,
    /// Garbage counter of the timer queue, set once registered there.
    timer_garbage: RefCell<Option<Rc<Cell<usize>>>>,
}

impl Wakeup {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            inner: Rc::new(WakeupInner {
                waker: RefCell::new(waker),
                state: Cell::new(WakeState::Armed),
                wait_queue: RefCell::new(None),
                timer_garbage: RefCell::new(None),
            }),
        }
    }

    /// Fire the wakeup with the given reason.
    ///
    /// Returns `true` exactly once: the first call marks the wakeup spent
    /// and resumes the owning task; every later call is a no-op returning
    /// `false`.
    pub(crate) fn fire(&self, reason: WakeReason) -> bool {
        if self.is_spent() {
            return false;
        }
        self.inner.state.set(WakeState::Fired(reason));

        // Credit the queue that lost the race so it can collect this entry.
        match reason {
            WakeReason::Normal => self.credit_timer_garbage(),
            WakeReason::Timeout => self.credit_queue_garbage(),
            WakeReason::Abandoned => {
                self.credit_queue_garbage();
                self.credit_timer_garbage();
            }
        }

        if reason != WakeReason::Abandoned {
            self.inner.waker.borrow().wake_by_ref();
        }
        true
    }

    pub(crate) fn is_spent(&self) -> bool {
        !matches!(self.inner.state.get(), WakeState::Armed)
    }

    pub(crate) fn fired_reason(&self) -> Option<WakeReason> {
        match self.inner.state.get() {
            WakeState::Armed => None,
            WakeState::Fired(reason) => Some(reason),
        }
    }

    /// Replace the stored waker after a spurious poll.
    pub(crate) fn update_waker(&self, waker: &Waker) {
        if !self.inner.waker.borrow().will_wake(waker) {
            *self.inner.waker.borrow_mut() = waker.clone();
        }
    }

    fn attach_queue(&self, queue: &Rc<WaitQueueInner>) {
        *self.inner.wait_queue.borrow_mut() = Some(Rc::downgrade(queue));
    }

    /// Record the timer queue's garbage counter; called at registration.
    pub(crate) fn attach_timer(&self, garbage: Rc<Cell<usize>>) {
        *self.inner.timer_garbage.borrow_mut() = Some(garbage);
    }

    fn credit_queue_garbage(&self) {
        if let Some(queue) = self.inner.wait_queue.borrow().as_ref().and_then(Weak::upgrade) {
            queue.garbage.set(queue.garbage.get() + 1);
        }
    }

    fn credit_timer_garbage(&self) {
        if let Some(garbage) = self.inner.timer_garbage.borrow().as_ref() {
            garbage.set(garbage.get() + 1);
        }
    }
}

/// An ordered queue of wakeups waiting on one event source.
///
/// Spent wakeups are not removed eagerly; each queue counts them and
/// rebuilds its storage once garbage outnumbers live entries.
#[derive(Clone)]
pub(crate) struct WaitQueue {
    inner: Rc<WaitQueueInner>,
}

pub(crate) struct WaitQueueInner {
    entries: RefCell<VecDeque<Wakeup>>,
    garbage: Cell<usize>,
    /// Whether a cancelled-but-already-woken waiter should hand its wake on
    /// to the next entry. True for queues guarding a consumable resource
    /// (event value, queue slot, lock), false for pure condition queues.
    requeue_on_abandon: bool,
}

impl WaitQueue {
    pub(crate) fn new(requeue_on_abandon: bool) -> Self {
        Self {
            inner: Rc::new(WaitQueueInner {
                entries: RefCell::new(VecDeque::new()),
                garbage: Cell::new(0),
                requeue_on_abandon,
            }),
        }
    }

    /// Number of armed wakeups currently enqueued.
    pub(crate) fn waiter_count(&self) -> usize {
        self.inner.entries.borrow().len() - self.inner.garbage.get()
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiter_count() > 0
    }

    /// Fire the first armed wakeup. Returns whether one was found.
    pub(crate) fn wake_one(&self) -> bool {
        WaitQueueInner::wake_one(&self.inner)
    }

    /// Fire every armed wakeup. Returns how many were fired.
    pub(crate) fn wake_all(&self) -> usize {
        let drained: Vec<Wakeup> = self.inner.entries.borrow_mut().drain(..).collect();
        self.inner.garbage.set(0);
        let mut fired = 0;
        for wakeup in drained {
            if wakeup.fire(WakeReason::Normal) {
                fired += 1;
            }
        }
        fired
    }

    /// Suspend the current task on this queue until woken or `deadline`.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> WaitFuture {
        WaitFuture {
            queue: Some(self.inner.clone()),
            deadline,
            wakeup: None,
            finished: false,
        }
    }
}

impl WaitQueueInner {
    fn push(self: &Rc<Self>, wakeup: Wakeup) {
        self.collect_garbage();
        wakeup.attach_queue(self);
        self.entries.borrow_mut().push_back(wakeup);
    }

    fn wake_one(self: &Rc<Self>) -> bool {
        loop {
            let Some(wakeup) = self.entries.borrow_mut().pop_front() else {
                return false;
            };
            if wakeup.fire(WakeReason::Normal) {
                return true;
            }
            // Popped a spent entry: that was garbage, account for it.
            self.garbage.set(self.garbage.get() - 1);
        }
    }

    fn collect_garbage(&self) {
        let garbage = self.garbage.get();
        let live = self.entries.borrow().len() - garbage;
        if garbage > live {
            self.entries.borrow_mut().retain(|w| !w.is_spent());
            self.garbage.set(0);
        }
    }
}

/// Outcome of a [`WaitFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Woken,
    TimedOut,
}

impl WaitOutcome {
    pub(crate) fn into_result(self) -> Result<(), Timedout> {
        match self {
            Self::Woken => Ok(()),
            Self::TimedOut => Err(Timedout),
        }
    }
}

/// Future that suspends the current task on a wait queue and/or a deadline.
///
/// At least one of the two must be present. A wait with a queue and an
/// already-expired deadline resolves immediately without suspending; a pure
/// timer wait always suspends so that `sleep(0)` still yields to the
/// scheduler for one tick.
pub(crate) struct WaitFuture {
    queue: Option<Rc<WaitQueueInner>>,
    deadline: Option<Instant>,
    wakeup: Option<Wakeup>,
    finished: bool,
}

impl WaitFuture {
    /// A pure timer suspension with no event source.
    pub(crate) fn sleep_until(deadline: Instant) -> Self {
        Self {
            queue: None,
            deadline: Some(deadline),
            wakeup: None,
            finished: false,
        }
    }
}

impl Future for WaitFuture {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(wakeup) = &this.wakeup {
            return match wakeup.fired_reason() {
                None => {
                    wakeup.update_waker(cx.waker());
                    Poll::Pending
                }
                Some(WakeReason::Normal) => {
                    this.finished = true;
                    Poll::Ready(WaitOutcome::Woken)
                }
                Some(WakeReason::Timeout) => {
                    this.finished = true;
                    Poll::Ready(WaitOutcome::TimedOut)
                }
                Some(WakeReason::Abandoned) => unreachable!("abandoned wakeup polled"),
            };
        }

        debug_assert!(
            this.queue.is_some() || this.deadline.is_some(),
            "wait must have an event source or a deadline"
        );

        // An event wait whose budget is already exhausted fails fast,
        // without suspending or scheduling any other task.
        if this.queue.is_some()
            && this.deadline.is_some_and(|deadline| deadline <= Instant::now())
        {
            this.finished = true;
            return Poll::Ready(WaitOutcome::TimedOut);
        }

        let wakeup = Wakeup::new(cx.waker().clone());
        if let Some(queue) = &this.queue {
            queue.push(wakeup.clone());
        }
        if let Some(deadline) = this.deadline {
            scheduler::register_timer(deadline, wakeup.clone());
        }
        this.wakeup = Some(wakeup);
        Poll::Pending
    }
}

impl Drop for WaitFuture {
    fn drop(&mut self) {
        let Some(wakeup) = &self.wakeup else { return };
        if self.finished {
            return;
        }
        match wakeup.fired_reason() {
            // Cancelled while armed: both queues collect the entry later.
            None => {
                wakeup.fire(WakeReason::Abandoned);
            }
            // Woken but never observed: pass the wake on so the resource
            // this queue guards is not stranded.
            Some(WakeReason::Normal) => {
                if let Some(queue) = &self.queue {
                    if queue.requeue_on_abandon {
                        WaitQueueInner::wake_one(queue);
                    }
                }
            }
            _ => {}
        }
    }
}
