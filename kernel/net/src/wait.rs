//! Blocking wait primitives with scheduler integration.
//!
//! The network crate cannot depend on the process table directly (that would
//! invert the kernel's dependency graph), so blocking is split in two:
//!
//! - [`WaitQueue`] lives here and carries the state a waiter needs to detect
//!   wakeups and closure without a scheduler.
//! - [`WaitHooks`] is implemented by the kernel core and registered once at
//!   boot.  It performs the actual block/unblock against the scheduler.
//!
//! Until hooks are registered (early boot), waits degrade to non-blocking
//! polls.  Host-side tests register a thread-based implementation.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outcome of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Explicitly woken by `wake_one`/`wake_all`.
    Woken,
    /// Timeout expired before a wakeup (also returned by non-blocking polls).
    TimedOut,
    /// The queue was closed while waiting.
    Closed,
    /// No process context is available (kernel thread without hooks).
    NoProcess,
}

/// Scheduler integration for blocking waits.
///
/// Implementations must:
/// - wake waiters in FIFO order for `wake_one`,
/// - re-check [`WaitQueue::try_consume_wakeup`] and [`WaitQueue::is_closed`]
///   around every block, so a signal racing the block is never lost,
/// - not hold locks across the reschedule.
pub trait WaitHooks: Send + Sync {
    /// Block the current task until woken, timed out, or the queue is closed.
    ///
    /// `timeout_ns` of `None` blocks indefinitely; `Some(0)` is a
    /// non-blocking poll.
    fn wait(&self, queue: &WaitQueue, timeout_ns: Option<u64>) -> WaitOutcome;

    /// Wake one waiter blocked on this queue.
    fn wake_one(&self, queue: &WaitQueue);

    /// Wake all waiters blocked on this queue.
    fn wake_all(&self, queue: &WaitQueue);

    /// Monotonic milliseconds since boot, for timeout bookkeeping.
    fn get_ticks(&self) -> u64;
}

/// Static storage for the registered wait hooks.
static WAIT_HOOKS: spin::Once<&'static dyn WaitHooks> = spin::Once::new();

/// Register the kernel's wait hooks.
///
/// Called once during kernel initialization, after the scheduler is up.
/// Only the first registration takes effect.
pub fn register_wait_hooks(hooks: &'static dyn WaitHooks) {
    WAIT_HOOKS.call_once(|| hooks);
}

/// Get the registered wait hooks, if any.
#[inline]
pub(crate) fn wait_hooks() -> Option<&'static dyn WaitHooks> {
    WAIT_HOOKS.get().copied()
}

/// Monotonic milliseconds since boot; 0 until hooks are registered.
#[inline]
pub fn ticks() -> u64 {
    wait_hooks().map(|h| h.get_ticks()).unwrap_or(0)
}

/// Convert a millisecond timeout to the nanosecond resolution of the hooks.
#[inline]
pub(crate) const fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

/// Wait queue with optional scheduler integration.
///
/// The queue itself only tracks a closed flag and a pending-wakeup counter;
/// waiter bookkeeping is delegated to the registered [`WaitHooks`].  The
/// counter makes a `wake_one` that arrives before the waiter blocks stick:
/// the next wait consumes it instead of sleeping.
pub struct WaitQueue {
    closed: AtomicBool,
    wakeup_count: AtomicU64,
}

impl WaitQueue {
    /// Create an open queue with no pending wakeups.
    pub const fn new() -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
        }
    }

    /// Wait with an optional timeout in nanoseconds.
    ///
    /// `Some(0)` is a non-blocking poll. Without registered hooks this
    /// degrades to a poll regardless of the timeout.
    pub fn wait_with_timeout(&self, timeout_ns: Option<u64>) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        if timeout_ns == Some(0) {
            return WaitOutcome::TimedOut;
        }

        // Consume a wake signal that arrived before we got here, so a ready
        // resource never puts us to sleep.
        if self.try_consume_wakeup() {
            return WaitOutcome::Woken;
        }

        match wait_hooks() {
            Some(hooks) => hooks.wait(self, timeout_ns),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Atomically consume one pending wakeup, if any.
    ///
    /// Public so that [`WaitHooks`] implementations can use it as the block
    /// predicate.
    pub fn try_consume_wakeup(&self) -> bool {
        self.wakeup_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current > 0 {
                    Some(current - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Signal one waiter (FIFO).  If nobody is blocked, the signal is stored
    /// for the next wait.
    pub fn wake_one(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = wait_hooks() {
            hooks.wake_one(self);
        }
    }

    /// Signal all waiters.
    pub fn wake_all(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = wait_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Close the queue: pending and future waits return [`WaitOutcome::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(hooks) = wait_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Check if the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_wakeup_is_consumed_before_blocking() {
        let queue = WaitQueue::new();
        queue.wake_one();
        assert_eq!(queue.wait_with_timeout(None), WaitOutcome::Woken);
    }

    #[test]
    fn zero_timeout_is_a_poll() {
        let queue = WaitQueue::new();
        assert_eq!(queue.wait_with_timeout(Some(0)), WaitOutcome::TimedOut);
    }

    #[test]
    fn closed_queue_rejects_waits() {
        let queue = WaitQueue::new();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.wait_with_timeout(None), WaitOutcome::Closed);
    }

    #[test]
    fn wakeups_accumulate() {
        let queue = WaitQueue::new();
        queue.wake_one();
        queue.wake_one();
        assert!(queue.try_consume_wakeup());
        assert!(queue.try_consume_wakeup());
        assert!(!queue.try_consume_wakeup());
    }
}
