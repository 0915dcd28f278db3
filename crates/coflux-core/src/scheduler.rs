//! The cooperative scheduler: a single-threaded executor with an integrated
//! timer queue and OS readiness poll.
//!
//! One OS thread hosts every task. A task runs until it suspends on a timer,
//! an event or descriptor readiness, at which point control returns to the
//! scheduler loop. Each loop turn dispatches all currently-ready tasks in
//! FIFO wake order, fires expired timers, hands the yield queue its turn
//! when nothing else is runnable, and finally blocks in the OS poll for
//! exactly as long as the earliest timer allows.
//!
//! Other threads interact with the scheduler only through `Send` handles:
//! task wakers and the callback bridge push onto an injector channel and
//! ring a self-pipe to interrupt the poll.
//!
//! # Example
//!
//! ```
//! use coflux_core::Scheduler;
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new().unwrap();
//! let value = scheduler.run(async {
//!     let task = coflux_core::spawn(async { 21 * 2 });
//!     coflux_core::sleep(Duration::from_millis(1)).await;
//!     task.join().await
//! });
//! assert_eq!(value, 42);
//! ```

use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use mio::Token;
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::callback::CallbackSender;
use crate::error::Result;
use crate::poller::{PollEvents, PollRegistry};
use crate::wakeup::{WaitFuture, WaitQueue, WakeReason, Wakeup};

new_key_type! {
    /// Identity of a spawned task within its scheduler.
    ///
    /// Used by reentrant primitives (such as `RLock`) to recognise the task
    /// that currently holds a resource.
    pub struct TaskId;
}

/// Token reserved for the scheduler's own wake pipe.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Readiness events delivered by an external poll hook, and the shape the
/// hook must return.
pub type PollList = Vec<(RawFd, PollEvents)>;

thread_local! {
    static CURRENT: RefCell<Option<Rc<SchedulerInner>>> = const { RefCell::new(None) };
}

/// A task slot: the boxed future plus the waker that reschedules it.
struct TaskSlot {
    /// Taken out of the slot while the task is being polled.
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    waker: Waker,
}

/// The `Send` half of the scheduler, shared with task wakers.
///
/// Waking a task from any thread pushes its id onto the injector channel;
/// if the scheduler is blocked in the OS poll at that moment, one byte down
/// the self-pipe interrupts it.
pub(crate) struct Remote {
    ready_tx: crossbeam_channel::Sender<TaskId>,
    wake_pipe: Mutex<mio::unix::pipe::Sender>,
    /// Set while the scheduler thread is (about to be) blocked in the poll.
    polling: AtomicBool,
}

impl Remote {
    fn schedule(&self, task: TaskId) {
        let _ = self.ready_tx.send(task);
        if self.polling.load(Ordering::SeqCst) {
            // A full pipe already guarantees a pending wakeup.
            let _ = self.wake_pipe.lock().write(&[1]);
        }
    }
}

struct TaskWaker {
    task: TaskId,
    remote: Arc<Remote>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.remote.schedule(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.remote.schedule(self.task);
    }
}

/// An entry in the timer queue (min-heap by deadline).
///
/// The sequence number keeps tasks sleeping until the same deadline in FIFO
/// registration order.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    wakeup: Wakeup,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Ordered set of (deadline, wakeup) pairs.
///
/// Wakeups consumed by their event source before the deadline stay in the
/// heap as garbage; the heap is rebuilt once garbage outnumbers live
/// entries.
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
    garbage: Rc<Cell<usize>>,
}

impl TimerHeap {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            garbage: Rc::new(Cell::new(0)),
        }
    }

    fn register(&mut self, deadline: Instant, wakeup: Wakeup) {
        self.collect_garbage();
        wakeup.attach_timer(self.garbage.clone());
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            wakeup,
        });
    }

    /// Deadline of the earliest live entry, if any.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if entry.wakeup.is_spent() {
                self.heap.pop();
                self.garbage.set(self.garbage.get() - 1);
            } else {
                return Some(entry.deadline);
            }
        }
        None
    }

    /// Remove and return all live wakeups whose deadline has passed.
    fn expire(&mut self, now: Instant) -> Vec<Wakeup> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if entry.wakeup.is_spent() {
                self.garbage.set(self.garbage.get() - 1);
            } else {
                expired.push(entry.wakeup);
            }
        }
        expired
    }

    fn collect_garbage(&mut self) {
        let garbage = self.garbage.get();
        let live = self.heap.len() - garbage;
        if garbage > live {
            let entries: Vec<TimerEntry> = std::mem::take(&mut self.heap)
                .into_iter()
                .filter(|entry| !entry.wakeup.is_spent())
                .collect();
            self.heap = entries.into();
            self.garbage.set(0);
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.garbage.set(0);
    }
}

pub(crate) struct SchedulerInner {
    tasks: RefCell<SlotMap<TaskId, TaskSlot>>,
    ready_rx: crossbeam_channel::Receiver<TaskId>,
    remote: Arc<Remote>,
    wake_pipe_rx: RefCell<mio::unix::pipe::Receiver>,
    timers: RefCell<TimerHeap>,
    yield_queue: WaitQueue,
    registry: RefCell<PollRegistry>,
    poll: RefCell<mio::Poll>,
    events: RefCell<mio::Events>,
    current_task: Cell<Option<TaskId>>,
    quit_flag: Cell<bool>,
    quit_queue: WaitQueue,
    callbacks: RefCell<Option<CallbackSender>>,
}

/// A single-threaded cooperative scheduler.
///
/// Construct one explicitly at program start and enter it with
/// [`Scheduler::run`]; every suspending primitive in this crate resolves to
/// the scheduler running on the current thread.
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    /// Create a new scheduler with its own OS poll and wake pipe.
    pub fn new() -> Result<Self> {
        let poll = mio::Poll::new()?;
        let (pipe_tx, mut pipe_rx) = mio::unix::pipe::new()?;
        poll.registry()
            .register(&mut pipe_rx, WAKE_TOKEN, mio::Interest::READABLE)?;

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        let remote = Arc::new(Remote {
            ready_tx,
            wake_pipe: Mutex::new(pipe_tx),
            polling: AtomicBool::new(false),
        });

        Ok(Self {
            inner: Rc::new(SchedulerInner {
                tasks: RefCell::new(SlotMap::with_key()),
                ready_rx,
                remote,
                wake_pipe_rx: RefCell::new(pipe_rx),
                timers: RefCell::new(TimerHeap::new()),
                yield_queue: WaitQueue::new(false),
                registry: RefCell::new(PollRegistry::new()),
                poll: RefCell::new(poll),
                events: RefCell::new(mio::Events::with_capacity(128)),
                current_task: Cell::new(None),
                quit_flag: Cell::new(false),
                quit_queue: WaitQueue::new(false),
                callbacks: RefCell::new(None),
            }),
        })
    }

    /// Run `future` as the main task, driving the scheduler until it
    /// completes. Returns the future's output; a panic in the main task is
    /// resumed in the caller.
    ///
    /// Any background tasks still pending when the main task completes are
    /// dropped.
    ///
    /// # Panics
    ///
    /// Panics if a scheduler is already running on this thread.
    pub fn run<F>(&self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.run_inner(future, None)
    }

    /// Run the scheduler under an externally-owned poll loop.
    ///
    /// Instead of calling the OS poll itself, each turn hands `hook` the
    /// computed poll list (including the scheduler's own wake pipe) and the
    /// allowed delay; the hook performs the wait however the host loop sees
    /// fit and returns the descriptors that became ready.
    pub fn run_with_poll_hook<F, H>(&self, future: F, mut hook: H) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
        H: FnMut(&[(RawFd, PollEvents)], Option<Duration>) -> PollList,
    {
        self.run_inner(future, Some(&mut hook))
    }

    fn run_inner<F>(
        &self,
        future: F,
        mut hook: Option<&mut dyn FnMut(&[(RawFd, PollEvents)], Option<Duration>) -> PollList>,
    ) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        CURRENT.with(|current| {
            assert!(
                current.borrow().is_none(),
                "a coflux scheduler is already running on this thread"
            );
            *current.borrow_mut() = Some(self.inner.clone());
        });
        let _guard = CurrentGuard;
        self.inner.quit_flag.set(false);

        // The default thread bridge lives for the duration of the run.
        let bridge = crate::callback::CallbackQueue::new()
            .unwrap_or_else(|err| panic!("failed to create the scheduler callback bridge: {err}"));
        *self.inner.callbacks.borrow_mut() = Some(bridge.sender());

        let main = crate::task::spawn(future);
        loop {
            self.tick();
            if main.is_finished() {
                break;
            }
            self.poll_step(&mut hook);
        }
        let output = main.take_output();

        drop(bridge);
        *self.inner.callbacks.borrow_mut() = None;
        self.inner.tasks.borrow_mut().clear();
        self.inner.timers.borrow_mut().clear();
        self.inner.registry.borrow_mut().clear();

        match output {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// One tick: fire expired timers and dispatch every currently-ready
    /// task in FIFO wake order.
    fn tick(&self) {
        let inner = &self.inner;

        // Wakes injected since the last poll, in FIFO order.
        let mut ready: Vec<TaskId> = inner.ready_rx.try_iter().collect();

        // Expired timers resume with the timeout reason.
        let now = Instant::now();
        for wakeup in inner.timers.borrow_mut().expire(now) {
            wakeup.fire(WakeReason::Timeout);
        }
        ready.extend(inner.ready_rx.try_iter());

        // Only when nothing else is runnable does the yield queue get its
        // turn: a yielding task resumes after all currently-ready tasks.
        if ready.is_empty() && inner.yield_queue.has_waiters() {
            inner.yield_queue.wake_all();
            ready.extend(inner.ready_rx.try_iter());
        }

        tracing::trace!(
            target: "coflux_core::scheduler",
            ready = ready.len(),
            "dispatching tick"
        );
        for task in ready {
            self.poll_task(task);
        }
    }

    fn poll_task(&self, task: TaskId) {
        let inner = &self.inner;
        // A task may be woken more than once per tick, or complete before a
        // stale wake arrives; an empty or missing slot is simply skipped.
        let Some((mut future, waker)) = inner.tasks.borrow_mut().get_mut(task).and_then(|slot| {
            slot.future.take().map(|future| (future, slot.waker.clone()))
        }) else {
            return;
        };

        inner.current_task.set(Some(task));
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);
        inner.current_task.set(None);

        match poll {
            Poll::Ready(()) => {
                inner.tasks.borrow_mut().remove(task);
            }
            Poll::Pending => {
                if let Some(slot) = inner.tasks.borrow_mut().get_mut(task) {
                    slot.future = Some(future);
                }
            }
        }
    }

    fn poll_step(
        &self,
        hook: &mut Option<&mut dyn FnMut(&[(RawFd, PollEvents)], Option<Duration>) -> PollList>,
    ) {
        let inner = &self.inner;

        // Publish the polling flag before the final emptiness check so that
        // a racing waker either lands in the drained channel or rings the
        // pipe and cuts the poll short.
        inner.remote.polling.store(true, Ordering::SeqCst);

        let delay = if !inner.ready_rx.is_empty() || inner.yield_queue.has_waiters() {
            Some(Duration::ZERO)
        } else if let Some(deadline) = inner.timers.borrow_mut().next_deadline() {
            Some(
                deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1)),
            )
        } else {
            None
        };

        match hook {
            None => {
                let poll_guard = inner.poll.borrow();
                inner.registry.borrow_mut().prepare(Some(poll_guard.registry()));
                drop(poll_guard);

                let mut events = inner.events.borrow_mut();
                match inner.poll.borrow_mut().poll(&mut events, delay) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => {
                        tracing::error!(target: "coflux_core::scheduler", %err, "OS poll failed");
                    }
                }
                inner.remote.polling.store(false, Ordering::SeqCst);

                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let fd = event.token().0 as RawFd;
                    let fired = PollEvents::from_mio(event);
                    inner.registry.borrow_mut().distribute(fd, fired);
                }
            }
            Some(hook) => {
                // The host loop owns the wait; include our wake pipe so
                // cross-thread wakes still interrupt it.
                let wake_fd = inner.wake_pipe_rx.borrow().as_raw_fd();
                let mut poll_list = inner.registry.borrow_mut().prepare(None);
                poll_list.push((wake_fd, PollEvents::IN));

                let fired = hook(&poll_list, delay);
                inner.remote.polling.store(false, Ordering::SeqCst);

                for (fd, events) in fired {
                    if fd == wake_fd {
                        continue;
                    }
                    inner.registry.borrow_mut().distribute(fd, events);
                }
            }
        }

        inner.drain_wake_pipe();
    }
}

impl SchedulerInner {
    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_pipe_rx.borrow_mut().read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(target: "coflux_core::scheduler", %err, "wake pipe read failed");
                    break;
                }
            }
        }
    }
}

struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

pub(crate) fn with_current<R>(f: impl FnOnce(&Rc<SchedulerInner>) -> R) -> R {
    CURRENT.with(|current| {
        let borrow = current.borrow();
        let inner = borrow.as_ref().unwrap_or_else(|| {
            panic!(
                "no coflux scheduler is running on this thread; \
                 suspending operations must be called from within Scheduler::run"
            )
        });
        f(inner)
    })
}

/// Whether the current thread is driving a scheduler.
pub fn on_scheduler_thread() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Register a wakeup on the current scheduler's timer queue.
pub(crate) fn register_timer(deadline: Instant, wakeup: Wakeup) {
    with_current(|inner| inner.timers.borrow_mut().register(deadline, wakeup));
}

/// Insert a prepared task future and schedule its first poll.
pub(crate) fn spawn_raw(future: Pin<Box<dyn Future<Output = ()>>>) -> TaskId {
    with_current(|inner| {
        let remote = inner.remote.clone();
        let task = inner.tasks.borrow_mut().insert_with_key(|key| TaskSlot {
            future: Some(future),
            waker: Waker::from(Arc::new(TaskWaker {
                task: key,
                remote: remote.clone(),
            })),
        });
        remote.schedule(task);
        tracing::trace!(target: "coflux_core::scheduler", ?task, "task spawned");
        task
    })
}

/// Identity of the task currently being polled, if any.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .and_then(|inner| inner.current_task.get())
    })
}

/// The default thread-bridge sender of the running scheduler.
pub(crate) fn default_callback_sender() -> CallbackSender {
    with_current(|inner| {
        inner
            .callbacks
            .borrow()
            .clone()
            .expect("scheduler is running without a callback bridge")
    })
}

pub(crate) fn add_poller(poller: &Rc<crate::poller::PollerShared>) {
    with_current(|inner| inner.registry.borrow_mut().add(poller));
}

/// Suspend the current task for at least `duration`.
pub async fn sleep(duration: Duration) {
    sleep_until(Instant::now() + duration).await;
}

/// Suspend the current task until `deadline` has passed.
///
/// A deadline in the past still suspends for one scheduler tick, so
/// `sleep(Duration::ZERO)` always gives other ready tasks a chance to run.
pub async fn sleep_until(deadline: Instant) {
    let _ = WaitFuture::sleep_until(deadline).await;
}

/// Defer the current task until every task that is currently ready has run.
pub async fn yield_now() {
    let wait = with_current(|inner| inner.yield_queue.wait_until(None));
    let _ = wait.await;
}

/// Request orderly shutdown: wake every task blocked in [`wait_for_quit`].
pub fn quit() {
    with_current(|inner| {
        inner.quit_flag.set(true);
        inner.quit_queue.wake_all();
    });
}

/// Suspend until [`quit`] is called.
pub async fn wait_for_quit() {
    loop {
        let wait = with_current(|inner| {
            if inner.quit_flag.get() {
                None
            } else {
                Some(inner.quit_queue.wait_until(None))
            }
        });
        match wait {
            None => return,
            Some(wait) => {
                let _ = wait.await;
            }
        }
    }
}
