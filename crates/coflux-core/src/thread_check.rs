//! Thread affinity verification utilities.
//!
//! Scheduler state is single-threaded by design: every queue, timer and
//! synchronisation object must only be touched on the thread driving the
//! scheduler. The [`ThreadAffinity`] tracker records the thread an object
//! was created on and asserts later accesses happen there; the debug
//! variants are free in release builds and can be used liberally.

use std::thread::ThreadId;

/// Thread affinity tracker for objects bound to their creating thread.
///
/// # Example
///
/// ```
/// use coflux_core::thread_check::ThreadAffinity;
/// use std::cell::Cell;
///
/// struct Counter {
///     affinity: ThreadAffinity,
///     value: Cell<u32>,
/// }
///
/// impl Counter {
///     fn bump(&self) {
///         self.affinity.debug_assert_same_thread();
///         self.value.set(self.value.get() + 1);
///     }
/// }
///
/// let counter = Counter {
///     affinity: ThreadAffinity::current(),
///     value: Cell::new(0),
/// };
/// counter.bump();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::current()
    }
}

impl ThreadAffinity {
    /// Create a tracker bound to the current thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Whether the current thread matches this affinity.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Assert that we are on the same thread as the affinity.
    ///
    /// This always runs, in both debug and release builds.
    ///
    /// # Panics
    ///
    /// Panics with a descriptive message if called from a different thread.
    #[inline]
    pub fn assert_same_thread(&self) {
        self.assert_same_thread_with_msg("object accessed from wrong thread");
    }

    /// Assert that we are on the same thread, with a custom message.
    ///
    /// # Panics
    ///
    /// Panics if called from a different thread.
    pub fn assert_same_thread_with_msg(&self, msg: &str) {
        if !self.is_same_thread() {
            self.panic_wrong_thread(msg);
        }
    }

    /// Debug-only assertion that we are on the same thread.
    ///
    /// A no-op in release builds.
    #[inline]
    pub fn debug_assert_same_thread(&self) {
        #[cfg(debug_assertions)]
        self.assert_same_thread();
    }

    #[cold]
    #[inline(never)]
    fn panic_wrong_thread(&self, msg: &str) -> ! {
        let current = std::thread::current();
        let current_name = current.name().unwrap_or("<unnamed>");
        let current_id = current.id();

        panic!(
            "THREAD AFFINITY VIOLATION: {msg}\n\
             Object was created on thread: {:?}\n\
             Current thread: \"{current_name}\" (ID: {current_id:?})\n\
             Scheduler objects must only be used on the scheduler thread; \
             foreign threads interact through CallbackSender::post, \
             CallbackSender::call_result or a ThreadedEventQueue.",
            self.thread_id
        )
    }
}
