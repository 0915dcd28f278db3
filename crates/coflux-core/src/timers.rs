//! Callback timers built on the scheduler's timer queue.
//!
//! A [`Timer`] runs its callback on the scheduler thread when its delay
//! expires. One-shot timers fire once, repeating timers fire at a fixed
//! interval, and a reusable one-shot timer can be re-armed with
//! [`Timer::reset`] after it has fired. Cancellation and reset are
//! delivered through a control event to the timer's own task, so they take
//! effect even while the timer is mid-wait.

use std::time::{Duration, Instant};

use crate::error::Timedout;
use crate::sync::Event;
use crate::task::spawn;
use crate::time::Timeout;

#[derive(Clone)]
enum TimerCommand {
    Reset(Duration),
    Cancel,
}

/// How a timer behaves after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Fires once, then the timer is finished.
    OneShot,
    /// Fires once, then stays armed awaiting a [`Timer::reset`].
    Reusable,
    /// Fires repeatedly at the configured interval.
    Repeating,
}

/// A cancellable callback timer.
///
/// Dropping the handle does not cancel the timer; call [`Timer::cancel`]
/// to stop it.
pub struct Timer {
    control: Event<TimerCommand>,
}

impl Timer {
    /// Run `callback` once after `delay`.
    pub fn one_shot<F>(delay: Duration, callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::start(delay, TimerKind::OneShot, callback)
    }

    /// Run `callback` once after `delay`, keeping the timer re-armable
    /// with [`Timer::reset`] afterwards.
    pub fn one_shot_reusable<F>(delay: Duration, callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::start(delay, TimerKind::Reusable, callback)
    }

    /// Run `callback` every `interval`, drift-free, until cancelled.
    pub fn repeating<F>(interval: Duration, callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::start(interval, TimerKind::Repeating, callback)
    }

    fn start<F>(delay: Duration, kind: TimerKind, callback: F) -> Self
    where
        F: FnMut() + 'static,
    {
        let control = Event::new();
        spawn(run_timer(control.clone(), delay, kind, Box::new(callback))).detach();
        Self { control }
    }

    /// Re-arm the timer to fire `delay` from now, superseding the current
    /// schedule. After a reusable timer has fired this starts the next
    /// round; on a finished one-shot timer it has no effect.
    pub fn reset(&self, delay: Duration) {
        self.control.signal(TimerCommand::Reset(delay));
    }

    /// Stop the timer. No further callbacks will run.
    pub fn cancel(&self) {
        self.control.signal(TimerCommand::Cancel);
    }
}

async fn run_timer(
    control: Event<TimerCommand>,
    delay: Duration,
    kind: TimerKind,
    mut callback: Box<dyn FnMut()>,
) {
    let mut deadline = Some(Instant::now() + delay);
    loop {
        let timeout = match deadline {
            Some(deadline) => Timeout::At(deadline),
            None => Timeout::Forever,
        };
        match control.wait(timeout).await {
            Ok(TimerCommand::Cancel) => return,
            Ok(TimerCommand::Reset(delay)) => {
                deadline = Some(Instant::now() + delay);
            }
            Err(Timedout) => {
                callback();
                match kind {
                    TimerKind::OneShot => return,
                    TimerKind::Reusable => deadline = None,
                    TimerKind::Repeating => {
                        // Advance from the scheduled time to avoid drift.
                        deadline = deadline.map(|previous| previous + delay);
                    }
                }
            }
        }
    }
}
