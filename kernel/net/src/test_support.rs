//! Std-backed hook implementations shared by the unit tests.
//!
//! The kernel registers scheduler-integrated hooks at boot; on the host the
//! tests register these instead, so blocking waits are real condvar waits and
//! worker "kernel tasks" are ordinary threads.  Hook registration is
//! process-wide and one-shot, which matches the kernel's own lifecycle.

use alloc::boxed::Box;
use core::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::sched::{register_sched_hooks, Pid, ProcessState, SchedHooks};
use crate::wait::{register_wait_hooks, WaitHooks, WaitOutcome, WaitQueue};

struct Waiter {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Condvar-backed blocking, keyed by wait queue identity.
pub struct StdWaitHooks {
    waiters: Mutex<HashMap<usize, Arc<Waiter>>>,
    start: Instant,
}

impl StdWaitHooks {
    fn new() -> Self {
        StdWaitHooks {
            waiters: Mutex::new(HashMap::new()),
            start: Instant::now(),
        }
    }

    fn waiter_for(&self, queue: &WaitQueue) -> Arc<Waiter> {
        let key = queue as *const WaitQueue as usize;
        self.waiters
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Waiter {
                    lock: Mutex::new(()),
                    cond: Condvar::new(),
                })
            })
            .clone()
    }
}

impl WaitHooks for StdWaitHooks {
    fn wait(&self, queue: &WaitQueue, timeout_ns: Option<u64>) -> WaitOutcome {
        let waiter = self.waiter_for(queue);
        let deadline = timeout_ns.map(|ns| Instant::now() + Duration::from_nanos(ns));

        let mut guard = waiter.lock.lock().unwrap();
        loop {
            if queue.is_closed() {
                return WaitOutcome::Closed;
            }
            if queue.try_consume_wakeup() {
                return WaitOutcome::Woken;
            }
            match deadline {
                None => guard = waiter.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let (next, _) = waiter.cond.wait_timeout(guard, deadline - now).unwrap();
                    guard = next;
                }
            }
        }
    }

    fn wake_one(&self, queue: &WaitQueue) {
        let waiter = self.waiter_for(queue);
        // Taking the lock orders the wakeup against a waiter between its
        // predicate check and its block.
        let _guard = waiter.lock.lock().unwrap();
        waiter.cond.notify_all();
    }

    fn wake_all(&self, queue: &WaitQueue) {
        self.wake_one(queue);
    }

    fn get_ticks(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Thread-backed kernel tasks plus a settable process registry.
pub struct StdSchedHooks {
    next_pid: AtomicU64,
    states: Mutex<HashMap<Pid, ProcessState>>,
}

std::thread_local! {
    static CURRENT_PID: Cell<u64> = Cell::new(1);
}

impl SchedHooks for StdSchedHooks {
    fn spawn_kernel_task(&self, name: &str, task: Box<dyn FnOnce() + Send>) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(name.into())
            .spawn(task)
            .expect("kernel task thread");
        pid
    }

    fn queue_system_process(&self, _pid: Pid) {}

    fn current_pid(&self) -> Pid {
        CURRENT_PID.with(|pid| pid.get())
    }

    fn process_state(&self, pid: Pid) -> ProcessState {
        *self
            .states
            .lock()
            .unwrap()
            .get(&pid)
            .unwrap_or(&ProcessState::Running)
    }
}

fn wait_hooks_instance() -> &'static StdWaitHooks {
    static INSTANCE: OnceLock<StdWaitHooks> = OnceLock::new();
    INSTANCE.get_or_init(StdWaitHooks::new)
}

fn sched_hooks_instance() -> &'static StdSchedHooks {
    static INSTANCE: OnceLock<StdSchedHooks> = OnceLock::new();
    INSTANCE.get_or_init(|| StdSchedHooks {
        next_pid: AtomicU64::new(100),
        states: Mutex::new(HashMap::new()),
    })
}

/// Register the std-backed hooks.  Idempotent; call at the top of any test
/// that blocks or spawns workers.
pub fn install() {
    klog::set_level(klog::Level::Warn);
    klog::set_sink(|args| std::print!("{}", args));
    register_wait_hooks(wait_hooks_instance());
    register_sched_hooks(sched_hooks_instance());
}

/// Pretend the current thread runs as `pid`.
pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.with(|current| current.set(pid));
}

/// Override the reported state of a process.
pub fn set_process_state(pid: Pid, state: ProcessState) {
    sched_hooks_instance()
        .states
        .lock()
        .unwrap()
        .insert(pid, state);
}
