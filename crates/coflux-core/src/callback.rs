//! The thread bridge: posting work into the scheduler from other OS
//! threads, and moving values in both directions.
//!
//! Scheduler state may only be touched on the scheduler thread. Foreign
//! threads interact through three primitives:
//!
//! - [`CallbackSender::post`] — fire-and-forget: enqueue a closure for the
//!   scheduler-side dispatcher task to run.
//! - [`CallbackSender::call_result`] — rendezvous: run an operation on the
//!   scheduler (it may suspend there) and block the calling OS thread for
//!   the outcome, re-raising any panic.
//! - [`ThreadedEventQueue`] — a FIFO whose producer end is thread-safe and
//!   whose consumer end works both cooperatively (on the scheduler) and
//!   blocking (on any other thread).
//!
//! The queue-plus-self-pipe protocol is ordered so a poster that sees the
//! dispatcher marked as waiting and rings the pipe can never race with a
//! dispatcher that missed the new entry: the waiting flag is cleared
//! *before* the queue is drained.

use std::collections::VecDeque;
use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::{Condvar, Mutex};
use pin_project_lite::pin_project;
use static_assertions::assert_impl_all;

use crate::error::{Result, SignalError, Timedout, WaitError};
use crate::poller::{PollEvents, poll_one};
use crate::scheduler;
use crate::task::spawn;
use crate::time::Timeout;

type Job = Box<dyn FnOnce() + Send + 'static>;
type PanicPayload = Box<dyn std::any::Any + Send + 'static>;

/// A scheduler-side callback queue with its dispatcher task.
///
/// Dropping the queue and every [`CallbackSender`] closes the write end of
/// the self-pipe; the dispatcher observes the zero-length read, drains any
/// callbacks already enqueued and terminates.
pub struct CallbackQueue {
    shared: Arc<CallbackShared>,
}

struct CallbackShared {
    jobs: crossbeam_channel::Sender<Job>,
    waiting: Arc<AtomicBool>,
    pipe: Mutex<mio::unix::pipe::Sender>,
}

impl CallbackQueue {
    /// Create a callback queue and spawn its dispatcher on the current
    /// scheduler.
    pub fn new() -> Result<Self> {
        let (pipe_tx, pipe_rx) = mio::unix::pipe::new()?;
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let waiting = Arc::new(AtomicBool::new(false));

        // The dispatcher must not hold the write end, or the pipe could
        // never report closed.
        spawn(dispatch(jobs_rx, pipe_rx, waiting.clone())).detach();

        Ok(Self {
            shared: Arc::new(CallbackShared {
                jobs: jobs_tx,
                waiting,
                pipe: Mutex::new(pipe_tx),
            }),
        })
    }

    /// A `Send + Sync` handle for posting from any thread.
    pub fn sender(&self) -> CallbackSender {
        CallbackSender {
            shared: self.shared.clone(),
        }
    }
}

async fn dispatch(
    jobs: crossbeam_channel::Receiver<Job>,
    mut pipe: mio::unix::pipe::Receiver,
    waiting: Arc<AtomicBool>,
) {
    let fd = pipe.as_raw_fd();
    loop {
        waiting.store(true, Ordering::SeqCst);
        let mut closed = false;
        if jobs.is_empty() {
            // Error-class events (the closed write end) wake this too.
            let _ = poll_one(fd, PollEvents::IN, Timeout::Forever).await;
            let mut buf = [0u8; 256];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(
                            target: "coflux_core::callback",
                            %err,
                            "callback pipe read failed"
                        );
                        closed = true;
                        break;
                    }
                }
            }
        }
        // Clear the flag before draining: a poster that enqueued after our
        // emptiness check has either made the queue visibly non-empty or
        // written a byte that cuts the next poll short.
        waiting.store(false, Ordering::SeqCst);

        while let Ok(job) = jobs.try_recv() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                tracing::error!(
                    target: "coflux_core::callback",
                    panic = panic_message(&payload),
                    "posted callback panicked"
                );
            }
        }

        if closed {
            tracing::debug!(target: "coflux_core::callback", "callback pipe closed, dispatcher exiting");
            return;
        }
    }
}

fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Thread-safe posting handle for a [`CallbackQueue`].
#[derive(Clone)]
pub struct CallbackSender {
    shared: Arc<CallbackShared>,
}

assert_impl_all!(CallbackSender: Send, Sync);

impl CallbackSender {
    /// Enqueue `f` to run on the scheduler thread. Never blocks.
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        let _ = self.shared.jobs.send(Box::new(f));
        if self.shared.waiting.load(Ordering::SeqCst) {
            // A full pipe already guarantees a pending wakeup.
            let _ = self.shared.pipe.lock().write(&[1]);
        }
    }

    /// Run an operation on the scheduler thread and block this OS thread
    /// for its outcome.
    ///
    /// `f` is called on the scheduler thread; the future it returns is
    /// spawned as a task there, so the operation is free to suspend. A
    /// panic in either is re-raised here. On timeout the scheduler-side
    /// task keeps running; only the rendezvous is abandoned.
    ///
    /// # Panics
    ///
    /// Panics when called from the scheduler thread, where blocking on the
    /// rendezvous would deadlock the loop that has to complete it — await
    /// the operation directly instead.
    pub fn call_result<T, F, Fut>(
        &self,
        f: F,
        timeout: impl Into<Timeout>,
    ) -> std::result::Result<T, Timedout>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        assert!(
            !scheduler::on_scheduler_thread(),
            "call_result would deadlock on the scheduler thread; await the operation instead"
        );

        let completion = Arc::new(Completion {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let remote = completion.clone();

        self.post(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Err(payload) => remote.deliver(Err(payload)),
            Ok(future) => {
                spawn(async move {
                    let outcome = CatchPanic { inner: future }.await;
                    remote.deliver(outcome);
                })
                .detach();
            }
        });

        let deadline = timeout.into().deadline();
        let mut slot = completion.slot.lock();
        while slot.is_none() {
            match deadline {
                None => completion.cond.wait(&mut slot),
                Some(deadline) => {
                    if completion.cond.wait_until(&mut slot, deadline).timed_out()
                        && slot.is_none()
                    {
                        return Err(Timedout);
                    }
                }
            }
        }
        match slot.take().unwrap() {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

struct Completion<T> {
    slot: Mutex<Option<std::result::Result<T, PanicPayload>>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    fn deliver(&self, outcome: std::result::Result<T, PanicPayload>) {
        *self.slot.lock() = Some(outcome);
        self.cond.notify_all();
    }
}

pin_project! {
    /// Future adapter capturing a panic instead of unwinding the executor.
    struct CatchPanic<F> {
        #[pin]
        inner: F,
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = std::result::Result<F::Output, PanicPayload>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match panic::catch_unwind(AssertUnwindSafe(|| this.inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// The default callback sender of the scheduler running on this thread.
///
/// Clone this on the scheduler thread and hand it to foreign threads; they
/// use it to post work back.
pub fn callback_sender() -> CallbackSender {
    scheduler::default_callback_sender()
}

/// Post `f` to the current scheduler's default callback queue.
pub fn post<F: FnOnce() + Send + 'static>(f: F) {
    scheduler::default_callback_sender().post(f);
}

/// A FIFO bridging values between OS threads and the scheduler.
///
/// [`signal`](ThreadedEventQueue::signal) is thread-safe and never blocks.
/// The consumer side is either the scheduler thread (cooperative
/// [`wait`](ThreadedEventQueue::wait), polling the queue's self-pipe) or
/// any other OS thread ([`wait_blocking`](ThreadedEventQueue::wait_blocking),
/// sleeping on a condition variable).
pub struct ThreadedEventQueue<T> {
    shared: Arc<TeqShared<T>>,
}

impl<T> Clone for ThreadedEventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

assert_impl_all!(ThreadedEventQueue<u8>: Send, Sync);

struct TeqShared<T> {
    items: Mutex<VecDeque<T>>,
    closed: AtomicBool,
    cond: Condvar,
    pipe_tx: Mutex<mio::unix::pipe::Sender>,
    pipe_rx: Mutex<mio::unix::pipe::Receiver>,
}

impl<T: Send> ThreadedEventQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Result<Self> {
        let (pipe_tx, pipe_rx) = mio::unix::pipe::new()?;
        Ok(Self {
            shared: Arc::new(TeqShared {
                items: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                cond: Condvar::new(),
                pipe_tx: Mutex::new(pipe_tx),
                pipe_rx: Mutex::new(pipe_rx),
            }),
        })
    }

    /// Append a value and wake one consumer. Callable from any thread.
    pub fn signal(&self, value: T) -> std::result::Result<(), SignalError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalError::Closed);
        }
        self.shared.items.lock().push_back(value);
        self.shared.cond.notify_one();
        self.ring();
        Ok(())
    }

    /// Wait for the next value on the scheduler thread.
    pub async fn wait(&self) -> std::result::Result<T, WaitError> {
        self.wait_timeout(Timeout::Forever).await
    }

    /// Wait for the next value on the scheduler thread, bounded.
    pub async fn wait_timeout(
        &self,
        timeout: impl Into<Timeout>,
    ) -> std::result::Result<T, WaitError> {
        let deadline = timeout.into().deadline();
        loop {
            if let Some(value) = self.shared.items.lock().pop_front() {
                return Ok(value);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(WaitError::Closed);
            }
            let fd = self.shared.pipe_rx.lock().as_raw_fd();
            poll_one(fd, PollEvents::IN, Timeout::from_deadline(deadline)).await?;
            self.drain_pipe();
        }
    }

    /// Wait for the next value on a non-scheduler thread, blocking it.
    ///
    /// # Panics
    ///
    /// Panics when called from the scheduler thread; use
    /// [`wait`](ThreadedEventQueue::wait) there.
    pub fn wait_blocking(
        &self,
        timeout: impl Into<Timeout>,
    ) -> std::result::Result<T, WaitError> {
        assert!(
            !scheduler::on_scheduler_thread(),
            "wait_blocking would stall the scheduler; use wait() on the scheduler thread"
        );
        let deadline = timeout.into().deadline();
        let mut items = self.shared.items.lock();
        loop {
            if let Some(value) = items.pop_front() {
                return Ok(value);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(WaitError::Closed);
            }
            match deadline {
                None => self.shared.cond.wait(&mut items),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut items, deadline).timed_out()
                        && items.is_empty()
                    {
                        return Err(WaitError::Timedout);
                    }
                }
            }
        }
    }

    /// Close the queue: queued values remain readable, further signals are
    /// rejected, and all waiters on both sides are released.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        self.ring();
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Whether no values are queued.
    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }

    fn ring(&self) {
        // One byte per wake hint; a full pipe already guarantees one.
        let _ = self.shared.pipe_tx.lock().write(&[1]);
    }

    fn drain_pipe(&self) {
        let mut pipe = self.shared.pipe_rx.lock();
        let mut buf = [0u8; 64];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}
