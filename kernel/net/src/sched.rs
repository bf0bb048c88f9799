//! Scheduler integration for the network subsystem.
//!
//! The subsystem needs four things from the process layer: kernel task
//! creation for its per-interface workers, the identity of the calling
//! process, and per-process liveness for inbound dispatch.  All of it goes
//! through a hook table registered once at boot, keeping this crate free of a
//! dependency on the scheduler proper.

use alloc::boxed::Box;

/// Process identifier.
pub type Pid = u64;

/// Coarse process lifecycle state, as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot is unused.
    Empty,
    /// Created but not yet runnable.
    New,
    /// Runnable or running.
    Running,
    /// Blocked on a wait queue or resource.
    Blocked,
    /// Exited, awaiting reaping.
    Zombie,
    /// Forcibly terminated.
    Killed,
}

impl ProcessState {
    /// A live process can own sockets and receive inbound packets.
    #[inline]
    pub fn is_live(self) -> bool {
        !matches!(
            self,
            ProcessState::Empty | ProcessState::New | ProcessState::Killed
        )
    }
}

/// Scheduler services consumed by the network subsystem.
pub trait SchedHooks: Send + Sync {
    /// Spawn a kernel task running `task`.
    ///
    /// The task is parented to pid 1 and scheduled at default priority; it is
    /// not runnable until [`queue_system_process`](Self::queue_system_process)
    /// is called with the returned pid.
    fn spawn_kernel_task(&self, name: &str, task: Box<dyn FnOnce() + Send>) -> Pid;

    /// Make a previously spawned kernel task runnable.
    fn queue_system_process(&self, pid: Pid);

    /// Pid of the process currently executing.
    fn current_pid(&self) -> Pid;

    /// Lifecycle state of the given process.
    fn process_state(&self, pid: Pid) -> ProcessState;
}

/// Static storage for the registered scheduler hooks.
static SCHED_HOOKS: spin::Once<&'static dyn SchedHooks> = spin::Once::new();

/// Register the kernel's scheduler hooks.
///
/// Called once during kernel initialization.  Only the first registration
/// takes effect.
pub fn register_sched_hooks(hooks: &'static dyn SchedHooks) {
    SCHED_HOOKS.call_once(|| hooks);
}

/// Get the registered scheduler hooks, if any.
#[inline]
pub(crate) fn sched_hooks() -> Option<&'static dyn SchedHooks> {
    SCHED_HOOKS.get().copied()
}

/// Pid of the caller; pid 1 while running without hooks (early boot).
#[inline]
pub(crate) fn current_pid() -> Pid {
    sched_hooks().map(|h| h.current_pid()).unwrap_or(1)
}

/// Whether `pid` may receive inbound packets.  Without hooks every owner is
/// presumed live.
#[inline]
pub(crate) fn process_is_live(pid: Pid) -> bool {
    sched_hooks()
        .map(|h| h.process_state(pid).is_live())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_excludes_empty_new_and_killed() {
        assert!(!ProcessState::Empty.is_live());
        assert!(!ProcessState::New.is_live());
        assert!(!ProcessState::Killed.is_live());
        assert!(ProcessState::Running.is_live());
        assert!(ProcessState::Blocked.is_live());
        assert!(ProcessState::Zombie.is_live());
    }
}
