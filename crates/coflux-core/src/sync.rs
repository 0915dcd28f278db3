//! Cooperative synchronisation objects.
//!
//! All of these are built on the one-shot wakeup queues of this crate and
//! may only be used from tasks on the scheduler thread. Every blocking
//! method takes a [`Timeout`]; expiry is reported as an error rather than
//! by cancelling the object's state.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{SignalError, Timedout, WaitError};
use crate::scheduler::{self, TaskId};
use crate::time::Timeout;
use crate::wakeup::WaitQueue;

/// A value-carrying event.
///
/// In the default auto-reset mode, each signalled value is consumed by
/// exactly one waiter; a value signalled with no waiters present is
/// retained until someone asks for it. In manual mode the value persists
/// (and is cloned to every waiter) until [`Event::reset`] clears it.
pub struct Event<T> {
    shared: Rc<EventShared<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct EventShared<T> {
    value: RefCell<Option<T>>,
    waiters: WaitQueue,
    auto_reset: bool,
}

impl<T> Event<T> {
    /// Create an auto-reset event.
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Create a manual-reset event: once signalled it stays set.
    pub fn new_manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto_reset: bool) -> Self {
        Self {
            shared: Rc::new(EventShared {
                value: RefCell::new(None),
                waiters: WaitQueue::new(true),
                auto_reset,
            }),
        }
    }

    /// Store `value` and release a waiter (all waiters in manual mode).
    ///
    /// If a previous value is still unconsumed it is replaced.
    pub fn signal(&self, value: T) {
        *self.shared.value.borrow_mut() = Some(value);
        if self.shared.auto_reset {
            self.shared.waiters.wake_one();
        } else {
            self.shared.waiters.wake_all();
        }
    }

    /// Whether a value is currently stored.
    pub fn is_set(&self) -> bool {
        self.shared.value.borrow().is_some()
    }

    /// Consume the stored value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.shared.value.borrow_mut().take()
    }

    /// Clear any stored value.
    pub fn reset(&self) {
        self.shared.value.borrow_mut().take();
    }
}

impl<T: Clone> Event<T> {
    /// Wait until the event is signalled, consuming the value in auto-reset
    /// mode.
    pub async fn wait(&self, timeout: impl Into<Timeout>) -> Result<T, Timedout> {
        let deadline = timeout.into().deadline();
        loop {
            if self.shared.auto_reset {
                if let Some(value) = self.shared.value.borrow_mut().take() {
                    return Ok(value);
                }
            } else if let Some(value) = self.shared.value.borrow().as_ref() {
                return Ok(value.clone());
            }
            self.shared.waiters.wait_until(deadline).await.into_result()?;
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A stateless condition: waiters block until the next signal.
///
/// Unlike [`Event`] a pulse carries nothing and remembers nothing; a signal
/// with no waiters is lost.
#[derive(Clone)]
pub struct Pulse {
    waiters: WaitQueue,
}

impl Pulse {
    /// Create a new pulse.
    pub fn new() -> Self {
        Self {
            waiters: WaitQueue::new(false),
        }
    }

    /// Suspend until the next signal.
    pub async fn wait(&self, timeout: impl Into<Timeout>) -> Result<(), Timedout> {
        let deadline = timeout.into().deadline();
        self.waiters.wait_until(deadline).await.into_result()
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn signal(&self) -> usize {
        self.waiters.wake_all()
    }

    /// Wake a single waiter. Returns whether one was waiting.
    pub fn signal_one(&self) -> bool {
        self.waiters.wake_one()
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO of values with cooperative consumers and a close flag.
///
/// Producers never block: pushing onto a full bounded queue or a closed
/// queue is rejected outright. Reading an empty closed queue reports
/// end-of-sequence.
pub struct EventQueue<T> {
    shared: Rc<QueueShared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct QueueShared<T> {
    items: RefCell<VecDeque<T>>,
    closed: Cell<bool>,
    capacity: Option<usize>,
    waiters: WaitQueue,
}

impl<T> EventQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue rejecting values beyond `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            shared: Rc::new(QueueShared {
                items: RefCell::new(VecDeque::new()),
                closed: Cell::new(false),
                capacity,
                waiters: WaitQueue::new(true),
            }),
        }
    }

    /// Append a value and release one waiter.
    pub fn signal(&self, value: T) -> Result<(), SignalError> {
        if self.shared.closed.get() {
            return Err(SignalError::Closed);
        }
        if let Some(capacity) = self.shared.capacity {
            if self.shared.items.borrow().len() >= capacity {
                return Err(SignalError::Full);
            }
        }
        self.shared.items.borrow_mut().push_back(value);
        self.shared.waiters.wake_one();
        Ok(())
    }

    /// Wait for the next value.
    pub async fn wait(&self, timeout: impl Into<Timeout>) -> Result<T, WaitError> {
        let deadline = timeout.into().deadline();
        loop {
            if let Some(value) = self.shared.items.borrow_mut().pop_front() {
                return Ok(value);
            }
            if self.shared.closed.get() {
                return Err(WaitError::Closed);
            }
            self.shared
                .waiters
                .wait_until(deadline)
                .await
                .into_result()
                .map_err(|_: Timedout| WaitError::Timedout)?;
        }
    }

    /// Close the queue: queued values remain readable, new signals are
    /// rejected, and all waiters are released.
    pub fn close(&self) {
        self.shared.closed.set(true);
        self.shared.waiters.wake_all();
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.shared.items.borrow().len()
    }

    /// Whether no values are queued.
    pub fn is_empty(&self) -> bool {
        self.shared.items.borrow().is_empty()
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reentrant cooperative lock.
///
/// The task holding the lock may acquire it again without blocking; the
/// lock is released once every guard has been dropped, at which point a
/// single pending acquirer is admitted.
#[derive(Clone)]
pub struct RLock {
    shared: Rc<LockShared>,
}

struct LockShared {
    owner: Cell<Option<TaskId>>,
    depth: Cell<usize>,
    waiters: WaitQueue,
}

impl RLock {
    /// Create a new, unowned lock.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(LockShared {
                owner: Cell::new(None),
                depth: Cell::new(0),
                waiters: WaitQueue::new(true),
            }),
        }
    }

    /// Acquire the lock, waiting until the deadline if another task holds
    /// it. Reentrant acquisition by the owner never blocks.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub async fn lock(&self, timeout: impl Into<Timeout>) -> Result<RLockGuard, Timedout> {
        let me = scheduler::current_task_id().expect("RLock::lock called outside of a task");
        if self.shared.owner.get() == Some(me) {
            self.shared.depth.set(self.shared.depth.get() + 1);
            return Ok(RLockGuard {
                shared: self.shared.clone(),
            });
        }

        let deadline = timeout.into().deadline();
        loop {
            if self.shared.owner.get().is_none() {
                self.shared.owner.set(Some(me));
                self.shared.depth.set(1);
                return Ok(RLockGuard {
                    shared: self.shared.clone(),
                });
            }
            self.shared.waiters.wait_until(deadline).await.into_result()?;
        }
    }

    /// Whether the calling task currently owns the lock.
    pub fn held_by_current_task(&self) -> bool {
        scheduler::current_task_id().is_some_and(|me| self.shared.owner.get() == Some(me))
    }

    /// Whether any task currently owns the lock.
    pub fn is_locked(&self) -> bool {
        self.shared.owner.get().is_some()
    }
}

impl Default for RLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one level of [`RLock`] ownership. Dropping the outermost
/// guard releases the lock and admits one waiter.
pub struct RLockGuard {
    shared: Rc<LockShared>,
}

impl Drop for RLockGuard {
    fn drop(&mut self) {
        let depth = self.shared.depth.get();
        debug_assert!(depth > 0, "lock released more often than acquired");
        self.shared.depth.set(depth - 1);
        if depth == 1 {
            self.shared.owner.set(None);
            self.shared.waiters.wake_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::spawn;
    use crate::{Scheduler, sleep};
    use std::time::Duration;

    #[test]
    fn test_auto_reset_event_delivers_to_one_waiter() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let event = Event::new();
            let winner = {
                let event = event.clone();
                spawn(async move { event.wait(Duration::from_secs(1)).await })
            };
            let loser = {
                let event = event.clone();
                spawn(async move { event.wait(Duration::from_millis(30)).await })
            };
            sleep(Duration::from_millis(5)).await;
            event.signal(99);

            assert_eq!(winner.join().await, Ok(99));
            // The second waiter never sees the consumed value.
            assert_eq!(loser.join().await, Err(Timedout));
        });
    }

    #[test]
    fn test_event_value_retained_without_waiters() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let event = Event::new();
            event.signal("kept");
            assert!(event.is_set());
            assert_eq!(event.wait(Timeout::Forever).await, Ok("kept"));
            assert!(!event.is_set());
        });
    }

    #[test]
    fn test_manual_event_stays_set_for_all_waiters() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let event = Event::new_manual();
            event.signal(7);
            assert_eq!(event.wait(Timeout::Forever).await, Ok(7));
            assert_eq!(event.wait(Timeout::Forever).await, Ok(7));
            event.reset();
            assert!(!event.is_set());
        });
    }

    #[test]
    fn test_ping_pong_tasks() {
        let scheduler = Scheduler::new().unwrap();
        let (ping_count, pong_count) = scheduler.run(async {
            let ping = Event::new();
            let pong = Event::new();

            let ping_task = {
                let ping = ping.clone();
                let pong = pong.clone();
                spawn(async move {
                    let mut count = 0;
                    for _ in 0..5 {
                        pong.signal(());
                        ping.wait(Duration::from_secs(1)).await.unwrap();
                        count += 1;
                    }
                    count
                })
            };
            let pong_task = {
                let ping = ping.clone();
                let pong = pong.clone();
                spawn(async move {
                    let mut count = 0;
                    for _ in 0..5 {
                        pong.wait(Duration::from_secs(1)).await.unwrap();
                        ping.signal(());
                        count += 1;
                    }
                    count
                })
            };

            (ping_task.join().await, pong_task.join().await)
        });
        assert_eq!(ping_count, 5);
        assert_eq!(pong_count, 5);
    }

    #[test]
    fn test_pulse_broadcast_releases_all_waiters() {
        let scheduler = Scheduler::new().unwrap();
        let released = scheduler.run(async {
            let pulse = Pulse::new();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let pulse = pulse.clone();
                    spawn(async move { pulse.wait(Duration::from_secs(1)).await.is_ok() })
                })
                .collect();
            sleep(Duration::from_millis(5)).await;
            assert_eq!(pulse.signal(), 3);

            let mut released = 0;
            for waiter in waiters {
                if waiter.join().await {
                    released += 1;
                }
            }
            released
        });
        assert_eq!(released, 3);
    }

    #[test]
    fn test_event_queue_preserves_values_and_order() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let queue = EventQueue::new();
            for n in 0..5 {
                queue.signal(n).unwrap();
            }
            for n in 0..5 {
                assert_eq!(queue.wait(Timeout::Forever).await, Ok(n));
            }
        });
    }

    #[test]
    fn test_bounded_queue_rejects_overflow() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let queue = EventQueue::with_capacity(2);
            assert_eq!(queue.signal(1), Ok(()));
            assert_eq!(queue.signal(2), Ok(()));
            assert_eq!(queue.signal(3), Err(SignalError::Full));
            assert_eq!(queue.wait(Timeout::Forever).await, Ok(1));
            assert_eq!(queue.signal(3), Ok(()));
        });
    }

    #[test]
    fn test_closed_queue_drains_then_reports_end() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let queue = EventQueue::new();
            queue.signal("last").unwrap();
            queue.close();
            assert_eq!(queue.signal("late"), Err(SignalError::Closed));
            assert_eq!(queue.wait(Timeout::Forever).await, Ok("last"));
            assert_eq!(
                queue.wait(Timeout::Forever).await,
                Err(WaitError::Closed)
            );
        });
    }

    #[test]
    fn test_close_releases_blocked_waiter() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let queue: EventQueue<u32> = EventQueue::new();
            let waiter = {
                let queue = queue.clone();
                spawn(async move { queue.wait(Duration::from_secs(5)).await })
            };
            sleep(Duration::from_millis(5)).await;
            queue.close();
            assert_eq!(waiter.join().await, Err(WaitError::Closed));
        });
    }

    #[test]
    fn test_rlock_reentrant_acquire_is_non_blocking() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let lock = RLock::new();
            let outer = lock.lock(Timeout::immediate()).await.unwrap();
            // Reentry must succeed even with an exhausted timeout.
            let inner = lock.lock(Timeout::immediate()).await.unwrap();
            assert!(lock.held_by_current_task());
            drop(inner);
            assert!(lock.is_locked());
            drop(outer);
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn test_rlock_admits_one_waiter_on_release() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(async {
            let lock = RLock::new();
            let guard = lock.lock(Timeout::Forever).await.unwrap();

            let contender = {
                let lock = lock.clone();
                spawn(async move {
                    let _guard = lock.lock(Duration::from_secs(1)).await.unwrap();
                    true
                })
            };
            sleep(Duration::from_millis(5)).await;
            assert!(lock.is_locked());
            drop(guard);
            assert!(contender.join().await);
        });
    }
}
