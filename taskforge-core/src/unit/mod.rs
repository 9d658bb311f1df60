/// Task unit hierarchy.
///
/// A task unit is a polymorphic work item: a user callable plus its state
/// machine, result channel, and metadata. Three concrete shapes share the
/// [`TaskUnit`] interface so the queue and worker can hold
/// `Arc<dyn TaskUnit>` without knowing which one they have:
///
/// - [`standard::StandardUnit`] — a typed promise and a `result_ready` flag.
/// - [`timed::TimedUnit`] — adds a timeout callback fired at most once.
/// - [`dependent::DependentUnit`] — adds a predecessor list and a cached
///   "dependencies satisfied" predicate.
pub mod dependent;
pub mod standard;
pub mod state;
pub mod timed;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use taskforge_shared::error::CapturedFailure;

pub use state::TaskState;

/// Named priority buckets. Only the integer ordering matters; equal
/// priorities tie-break by insertion order.
pub mod priority {
    pub const LOWEST: i32 = -20;
    pub const LOW: i32 = -10;
    pub const NORMAL: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const HIGHEST: i32 = 20;
    pub const CRITICAL: i32 = 30;
}

/// Errors a task unit's own operations can raise.
#[derive(Debug, Error)]
pub enum UnitError {
    /// `execute()` was called while the unit was not `pending`.
    #[error("unit {0} is not pending, cannot execute")]
    NotPending(u64),

    /// `get_result()` was called a second time.
    #[error("unit {0}'s result was already taken")]
    AlreadyTaken(u64),

    /// The unit was cancelled before it ran.
    #[error("unit {0} was cancelled")]
    Cancelled(u64),

    /// The unit's deadline elapsed before it started.
    #[error("unit {0} timed out before starting")]
    TimedOut(u64),

    /// The user callable panicked or otherwise failed during execution.
    #[error("unit {0} failed: {1}")]
    ExecutionFailure(u64, CapturedFailure),
}

/// The object-safe surface the scheduler, queue, and worker need, common
/// to all unit variants.
pub trait TaskUnit: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn seq(&self) -> u64;
    fn priority(&self) -> i32;
    fn set_priority(&self, priority: i32);
    fn state(&self) -> TaskState;
    fn submit_time(&self) -> Instant;
    fn start_time(&self) -> Option<Instant>;
    fn end_time(&self) -> Option<Instant>;
    fn deadline(&self) -> Option<Instant>;
    fn set_deadline(&self, deadline: Instant);
    fn set_timeout(&self, timeout: Duration) {
        self.set_deadline(Instant::now() + timeout);
    }

    /// Runs the unit's callable. Precondition: `state() == Pending`.
    fn execute(self: Arc<Self>);

    /// Attempts `pending -> cancelled`. Returns whether it succeeded.
    fn cancel(&self) -> bool;

    /// Attempts `pending -> timeout`. Returns whether it succeeded.
    fn mark_timeout(&self) -> bool;

    fn is_result_ready(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until a terminal state is reached.
    fn wait(&self);

    /// Blocks until a terminal state is reached or `timeout` elapses.
    /// Returns whether a terminal state was observed.
    fn wait_for(&self, timeout: Duration) -> bool;

    /// True for [`dependent::DependentUnit`] with unsatisfied predecessors;
    /// always true for other variants. The scheduler must not dispatch a
    /// unit for which this is false.
    fn are_dependencies_satisfied(&self) -> bool {
        true
    }
}

/// A [`TaskUnit`] that also exposes a typed `get_result()`.
///
/// The queue and worker only ever need the object-safe [`TaskUnit`]
/// surface (they don't know or care what `T` is); the pool facade hands
/// callers back `Arc<dyn ResultHandle<T>>` so they additionally get a
/// typed result without the facade needing to match on which concrete
/// unit variant it built.
pub trait ResultHandle<T>: TaskUnit {
    fn get_result(&self) -> Result<T, UnitError>;
}

impl<T: Send + 'static> ResultHandle<T> for standard::StandardUnit<T> {
    fn get_result(&self) -> Result<T, UnitError> {
        standard::StandardUnit::get_result(self)
    }
}

impl<T: Send + 'static> ResultHandle<T> for timed::TimedUnit<T> {
    fn get_result(&self) -> Result<T, UnitError> {
        timed::TimedUnit::get_result(self)
    }
}

impl<T: Send + 'static> ResultHandle<T> for dependent::DependentUnit<T> {
    fn get_result(&self) -> Result<T, UnitError> {
        dependent::DependentUnit::get_result(self)
    }
}

/// Fields and transition logic shared by every unit variant.
///
/// Each concrete unit type embeds a `UnitCore` and delegates the common
/// `TaskUnit` methods to it; `execute`/result publishing stay on the
/// concrete type since they depend on the callable's return type.
pub(crate) struct UnitCore {
    id: u64,
    name: String,
    seq: u64,
    priority: AtomicI32,
    submit_time: Instant,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    deadline: Mutex<Option<Instant>>,
    state: state::AtomicTaskState,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl UnitCore {
    pub(crate) fn new(id: u64, name: String, seq: u64, priority: i32) -> Self {
        UnitCore {
            id,
            name,
            seq,
            priority: AtomicI32::new(priority),
            submit_time: Instant::now(),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            deadline: Mutex::new(None),
            state: state::AtomicTaskState::new(TaskState::Pending),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn submit_time(&self) -> Instant {
        self.submit_time
    }

    pub(crate) fn start_time(&self) -> Option<Instant> {
        *self.start_time.lock()
    }

    pub(crate) fn end_time(&self) -> Option<Instant> {
        *self.end_time.lock()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    /// `pending -> running`. On success, records `start_time`.
    pub(crate) fn try_begin_running(&self) -> bool {
        if self.state.cas_from_pending(TaskState::Running) {
            *self.start_time.lock() = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// `running -> new_state`, recording `end_time` and waking waiters.
    pub(crate) fn finish_from_running(&self, new_state: TaskState) {
        debug_assert!(new_state.is_terminal());
        *self.end_time.lock() = Some(Instant::now());
        let succeeded = self.state.cas_from_running(new_state);
        debug_assert!(succeeded, "finish_from_running called outside running");
        self.notify_terminal();
    }

    /// `pending -> cancelled`. Returns whether it succeeded.
    pub(crate) fn try_cancel(&self) -> bool {
        if self.state.cas_from_pending(TaskState::Cancelled) {
            *self.end_time.lock() = Some(Instant::now());
            self.notify_terminal();
            true
        } else {
            false
        }
    }

    /// `pending -> timeout`. Returns whether it succeeded.
    pub(crate) fn try_timeout(&self) -> bool {
        if self.state.cas_from_pending(TaskState::Timeout) {
            *self.end_time.lock() = Some(Instant::now());
            self.notify_terminal();
            true
        } else {
            false
        }
    }

    fn notify_terminal(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut guard = self.wait_lock.lock();
        while !self.state().is_terminal() {
            self.wait_cv.wait(&mut guard);
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();
        loop {
            if self.state().is_terminal() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.state().is_terminal();
            }
            let timed_out = self.wait_cv.wait_for(&mut guard, remaining).timed_out();
            if timed_out {
                return self.state().is_terminal();
            }
        }
    }
}

/// A single-slot result channel: written exactly once by `execute()`,
/// `cancel()`, or `mark_timeout()`, read exactly once by `get_result()`.
pub(crate) struct ResultSlot<T> {
    slot: Mutex<Option<Result<T, UnitOutcomeError>>>,
}

/// The non-value outcomes a unit's result channel can carry.
#[derive(Debug, Clone)]
pub(crate) enum UnitOutcomeError {
    Cancelled,
    TimedOut,
    Failed(CapturedFailure),
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        ResultSlot {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn put(&self, value: Result<T, UnitOutcomeError>) {
        let mut guard = self.slot.lock();
        debug_assert!(guard.is_none(), "result channel delivers exactly once");
        *guard = Some(value);
    }

    /// Takes the result exactly once. Panics (a logic error, not a runtime
    /// condition) if called before a terminal state or a second time.
    pub(crate) fn take(&self, unit_id: u64) -> Result<T, UnitError> {
        let mut guard = self.slot.lock();
        match guard.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(UnitOutcomeError::Cancelled)) => Err(UnitError::Cancelled(unit_id)),
            Some(Err(UnitOutcomeError::TimedOut)) => Err(UnitError::TimedOut(unit_id)),
            Some(Err(UnitOutcomeError::Failed(failure))) => {
                Err(UnitError::ExecutionFailure(unit_id, failure))
            }
            None => Err(UnitError::AlreadyTaken(unit_id)),
        }
    }
}
