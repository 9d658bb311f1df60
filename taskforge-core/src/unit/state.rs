/// The task unit state machine.
///
/// ```text
/// pending ─► running ─► completed
///    │        │
///    │        └─► failed
///    ├─► cancelled        (only from pending)
///    └─► timeout          (only from pending; when deadline fired pre-run)
/// ```
///
/// `{completed, cancelled, timeout, failed}` are absorbing: once reached,
/// no further transition is permitted. All mutating transitions are
/// CAS-guarded from `pending`, matching the invariant that a unit's
/// terminal state is observed exactly once.
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
    Timeout = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            5 => TaskState::Timeout,
            other => panic!("invalid TaskState discriminant: {other}"),
        }
    }

    /// Terminal states are absorbing: `completed`, `failed`, `cancelled`,
    /// `timeout`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// An `AtomicU8`-backed `TaskState` with CAS helpers for the two legal
/// guarded transitions out of `pending` that don't also require
/// first observing `running` (`cancel`, `mark_timeout`), plus the
/// unconditional transitions out of `running`.
#[derive(Debug)]
pub struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub fn new(initial: TaskState) -> Self {
        AtomicTaskState(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts `pending -> to`. Returns whether the CAS succeeded.
    pub fn cas_from_pending(&self, to: TaskState) -> bool {
        self.0
            .compare_exchange(
                TaskState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempts `running -> to`. Returns whether the CAS succeeded.
    pub fn cas_from_running(&self, to: TaskState) -> bool {
        self.0
            .compare_exchange(
                TaskState::Running as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Timeout.is_terminal());
    }

    #[test]
    fn test_cas_from_pending_succeeds_once() {
        let state = AtomicTaskState::new(TaskState::Pending);
        assert!(state.cas_from_pending(TaskState::Cancelled));
        assert_eq!(state.load(), TaskState::Cancelled);
        assert!(!state.cas_from_pending(TaskState::Timeout));
        assert_eq!(state.load(), TaskState::Cancelled);
    }

    #[test]
    fn test_cas_from_running() {
        let state = AtomicTaskState::new(TaskState::Pending);
        assert!(state.cas_from_pending(TaskState::Running));
        assert!(state.cas_from_running(TaskState::Completed));
        assert_eq!(state.load(), TaskState::Completed);
        assert!(!state.cas_from_running(TaskState::Failed));
    }
}
