//! Single-threaded cooperative task runtime.
//!
//! This crate provides the foundational machinery of coflux:

#![warn(missing_docs)]
//!
//! - **Scheduler**: a single-threaded executor interleaving thousands of
//!   lightweight tasks, with an integrated timer queue and OS readiness poll
//! - **Synchronisation objects**: `Event`, `Pulse`, `EventQueue` and a
//!   reentrant `RLock`, all cooperative and timeout-aware
//! - **Tasks**: spawn/join handles with panic propagation to the joiner
//! - **Timers**: one-shot, reusable and repeating callback timers
//! - **Poll registry**: cooperative waits on file-descriptor readiness with
//!   per-event consumption across multiple listeners
//! - **Thread bridge**: callback posting, blocking rendezvous calls and
//!   bidirectional value queues for non-scheduler OS threads
//!
//! # Scheduling model
//!
//! Exactly one task runs at a time. A task keeps the thread until it awaits
//! a suspending operation (`sleep`, an event wait, a poll, a join), at which
//! point the scheduler dispatches the next ready task. There is no
//! preemption and no parallelism inside a scheduler; anything arriving from
//! another OS thread is marshalled through the thread bridge.
//!
//! # Example
//!
//! ```
//! use coflux_core::{Event, Scheduler, spawn};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new()?;
//! let greeting = scheduler.run(async {
//!     let event = Event::new();
//!     let producer = {
//!         let event = event.clone();
//!         spawn(async move {
//!             coflux_core::sleep(Duration::from_millis(1)).await;
//!             event.signal("hello");
//!         })
//!     };
//!     let value = event.wait(Duration::from_secs(1)).await.unwrap();
//!     producer.join().await;
//!     value
//! });
//! assert_eq!(greeting, "hello");
//! # Ok::<(), coflux_core::CoreError>(())
//! ```

pub mod callback;
mod error;
mod poller;
mod scheduler;
mod sync;
mod task;
pub mod thread_check;
mod time;
mod timers;
mod wakeup;

pub use callback::{CallbackQueue, CallbackSender, ThreadedEventQueue, callback_sender, post};
pub use error::{CoreError, Result, SignalError, Timedout, WaitError};
pub use poller::{PollEvents, poll_list, poll_one};
pub use scheduler::{
    PollList, Scheduler, TaskId, current_task_id, on_scheduler_thread, quit, sleep, sleep_until,
    wait_for_quit, yield_now,
};
pub use sync::{Event, EventQueue, Pulse, RLock, RLockGuard};
pub use task::{JoinHandle, join_all, spawn};
pub use thread_check::ThreadAffinity;
pub use time::Timeout;
pub use timers::Timer;
