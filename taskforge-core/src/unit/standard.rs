/// The standard task unit: a typed promise and a `result_ready` flag.
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskforge_shared::error::CapturedFailure;

use super::{priority, ResultSlot, TaskState, TaskUnit, UnitCore, UnitError, UnitOutcomeError};

/// A task unit wrapping a `FnOnce() -> T` callable.
///
/// `execute()` may only be called once (the callable is consumed); the
/// result is delivered exactly once via [`StandardUnit::get_result`].
pub struct StandardUnit<T: Send + 'static> {
    core: UnitCore,
    callable: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
    result: ResultSlot<T>,
}

impl<T: Send + 'static> StandardUnit<T> {
    pub fn new(
        id: u64,
        name: Option<String>,
        seq: u64,
        priority: i32,
        callable: Box<dyn FnOnce() -> T + Send>,
    ) -> Self {
        let name = name.unwrap_or_else(|| format!("task_{id}"));
        StandardUnit {
            core: UnitCore::new(id, name, seq, priority),
            callable: Mutex::new(Some(callable)),
            result: ResultSlot::new(),
        }
    }

    pub fn with_default_priority(
        id: u64,
        name: Option<String>,
        seq: u64,
        callable: Box<dyn FnOnce() -> T + Send>,
    ) -> Self {
        Self::new(id, name, seq, priority::NORMAL, callable)
    }

    /// Blocks until terminal, then returns the produced value or the
    /// captured error. Callable exactly once per unit — a second call
    /// returns [`UnitError::AlreadyTaken`].
    pub fn get_result(&self) -> Result<T, UnitError> {
        self.core.wait();
        self.result.take(self.core.id())
    }
}

impl<T: Send + 'static> TaskUnit for StandardUnit<T> {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn seq(&self) -> u64 {
        self.core.seq()
    }

    fn priority(&self) -> i32 {
        self.core.priority()
    }

    fn set_priority(&self, priority: i32) {
        self.core.set_priority(priority);
    }

    fn state(&self) -> TaskState {
        self.core.state()
    }

    fn submit_time(&self) -> Instant {
        self.core.submit_time()
    }

    fn start_time(&self) -> Option<Instant> {
        self.core.start_time()
    }

    fn end_time(&self) -> Option<Instant> {
        self.core.end_time()
    }

    fn deadline(&self) -> Option<Instant> {
        self.core.deadline()
    }

    fn set_deadline(&self, deadline: Instant) {
        self.core.set_deadline(deadline);
    }

    fn execute(self: Arc<Self>) {
        if !self.core.try_begin_running() {
            // Precondition violated: not pending. The worker already
            // filters on state before calling execute(); reaching here
            // means a racing cancel/timeout won the CAS, which is a
            // legitimate outcome, not a bug, so there is nothing further
            // to publish.
            return;
        }

        let callable = self
            .callable
            .lock()
            .take()
            .expect("execute() called more than once on a StandardUnit");

        match catch_unwind(AssertUnwindSafe(callable)) {
            Ok(value) => {
                self.result.put(Ok(value));
                self.core.finish_from_running(TaskState::Completed);
            }
            Err(payload) => {
                let failure = CapturedFailure::from_panic_payload(payload);
                self.result.put(Err(UnitOutcomeError::Failed(failure)));
                self.core.finish_from_running(TaskState::Failed);
            }
        }
    }

    fn cancel(&self) -> bool {
        if self.core.try_cancel() {
            self.result.put(Err(UnitOutcomeError::Cancelled));
            true
        } else {
            false
        }
    }

    fn mark_timeout(&self) -> bool {
        if self.core.try_timeout() {
            self.result.put(Err(UnitOutcomeError::TimedOut));
            true
        } else {
            false
        }
    }

    fn wait(&self) {
        self.core.wait();
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        self.core.wait_for(timeout)
    }
}
