//! Spawned tasks and their join handles.
//!
//! A spawned future runs as an independent task on the current scheduler.
//! Its output — or the payload of a panic it raised — lands in a shared
//! join state that the [`JoinHandle`] consumes. Joining a panicked task
//! resumes the panic at the joiner; a detached task's panic is only
//! logged, so a background failure cannot take the program down.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::error::Timedout;
use crate::scheduler::{self, TaskId};
use crate::time::Timeout;
use crate::wakeup::WaitQueue;

type PanicPayload = Box<dyn Any + Send + 'static>;

fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

struct JoinState<T> {
    result: RefCell<Option<Result<T, PanicPayload>>>,
    done: Cell<bool>,
    detached: Cell<bool>,
    completion: WaitQueue,
}

impl<T> JoinState<T> {
    fn complete(&self, result: Result<T, PanicPayload>) {
        self.done.set(true);
        if self.detached.get() {
            if let Err(payload) = &result {
                tracing::error!(
                    target: "coflux_core::task",
                    panic = panic_message(payload),
                    "detached task panicked"
                );
            }
            return;
        }
        *self.result.borrow_mut() = Some(result);
        self.completion.wake_all();
    }
}

pin_project! {
    /// Wrapper that routes a task's outcome into its join state.
    struct TaskFuture<F: Future> {
        #[pin]
        inner: F,
        state: Rc<JoinState<F::Output>>,
    }
}

impl<F: Future> Future for TaskFuture<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match panic::catch_unwind(AssertUnwindSafe(|| this.inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.state.complete(Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                this.state.complete(Err(payload));
                Poll::Ready(())
            }
        }
    }
}

/// Spawn `future` as a new task on the current scheduler.
///
/// The task is not polled before the next scheduler tick. Dropping the
/// returned handle detaches the task; it keeps running unobserved.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(JoinState {
        result: RefCell::new(None),
        done: Cell::new(false),
        detached: Cell::new(false),
        completion: WaitQueue::new(false),
    });
    let task = scheduler::spawn_raw(Box::pin(TaskFuture {
        inner: future,
        state: state.clone(),
    }));
    JoinHandle { state, task }
}

/// Owner side of a spawned task.
pub struct JoinHandle<T> {
    state: Rc<JoinState<T>>,
    task: TaskId,
}

impl<T> JoinHandle<T> {
    /// Identity of the underlying task.
    pub fn id(&self) -> TaskId {
        self.task
    }

    /// Whether the task has run to completion (or panicked).
    pub fn is_finished(&self) -> bool {
        self.state.done.get()
    }

    /// Wait for the task to complete and return its output.
    ///
    /// If the task panicked, the panic is resumed here.
    pub async fn join(self) -> T {
        match self.join_timeout(Timeout::Forever).await {
            Ok(value) => value,
            Err(Timedout) => unreachable!("unbounded join timed out"),
        }
    }

    /// Wait for the task to complete, giving up at the deadline.
    ///
    /// On timeout the task keeps running and the handle stays valid, so the
    /// join can be retried.
    ///
    /// # Panics
    ///
    /// Panics if the task's result was already consumed by an earlier
    /// successful join, and resumes the task's panic if it panicked.
    pub async fn join_timeout(&self, timeout: impl Into<Timeout>) -> Result<T, Timedout> {
        let deadline = timeout.into().deadline();
        loop {
            if self.state.done.get() {
                let result = self.state.result.borrow_mut().take();
                return match result {
                    Some(Ok(value)) => Ok(value),
                    Some(Err(payload)) => panic::resume_unwind(payload),
                    None => panic!("task result already consumed"),
                };
            }
            self.state.completion.wait_until(deadline).await.into_result()?;
        }
    }

    /// Give up on ever observing this task's result.
    ///
    /// Any stored result is discarded and a future completion is silently
    /// absorbed (panics are logged instead of propagated).
    pub fn detach(self) {
        // Drop does the work.
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.state.detached.set(true);
        if let Some(Err(payload)) = self.state.result.borrow_mut().take() {
            tracing::error!(
                target: "coflux_core::task",
                panic = panic_message(&payload),
                "abandoned task panicked"
            );
        }
    }
}

impl<T> JoinHandle<T> {
    /// Consume the finished task's outcome; used by the scheduler to
    /// collect the main task.
    pub(crate) fn take_output(self) -> Result<T, PanicPayload> {
        assert!(self.state.done.get(), "main task not finished");
        self.state
            .result
            .borrow_mut()
            .take()
            .expect("main task result already consumed")
    }
}

/// Join every handle in order, sharing one time budget.
///
/// The first panicking task aborts the join by resuming its panic; a
/// timeout abandons the remaining joins and returns `Timedout`.
pub async fn join_all<T>(
    handles: Vec<JoinHandle<T>>,
    timeout: impl Into<Timeout>,
) -> Result<Vec<T>, Timedout> {
    let deadline = timeout.into().deadline();
    let shared = match deadline {
        Some(deadline) => Timeout::At(deadline),
        None => Timeout::Forever,
    };
    let mut results = Vec::with_capacity(handles.len());
    for handle in &handles {
        results.push(handle.join_timeout(shared).await?);
    }
    Ok(results)
}
