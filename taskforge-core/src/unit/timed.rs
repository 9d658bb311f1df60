/// The timed task unit: adds a user-provided timeout callback fired at
/// most once when `mark_timeout` succeeds.
///
/// The callback only fires on pre-start timeouts; if the callable itself
/// runs past the deadline mid-execution, no enforcement happens — this
/// implementation does not guess at forced cancellation semantics for a
/// callable already running.
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskforge_shared::error::CapturedFailure;

use super::{priority, ResultSlot, TaskState, TaskUnit, UnitCore, UnitError, UnitOutcomeError};

pub struct TimedUnit<T: Send + 'static> {
    core: UnitCore,
    callable: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
    result: ResultSlot<T>,
    timeout_callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    timeout_fired: AtomicBool,
}

impl<T: Send + 'static> TimedUnit<T> {
    pub fn new(
        id: u64,
        name: Option<String>,
        seq: u64,
        priority: i32,
        callable: Box<dyn FnOnce() -> T + Send>,
        timeout_callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let name = name.unwrap_or_else(|| format!("task_{id}"));
        TimedUnit {
            core: UnitCore::new(id, name, seq, priority),
            callable: Mutex::new(Some(callable)),
            result: ResultSlot::new(),
            timeout_callback: Mutex::new(timeout_callback),
            timeout_fired: AtomicBool::new(false),
        }
    }

    pub fn with_default_priority(
        id: u64,
        name: Option<String>,
        seq: u64,
        callable: Box<dyn FnOnce() -> T + Send>,
        timeout_callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self::new(id, name, seq, priority::NORMAL, callable, timeout_callback)
    }

    pub fn get_result(&self) -> Result<T, UnitError> {
        self.core.wait();
        self.result.take(self.core.id())
    }
}

impl<T: Send + 'static> TaskUnit for TimedUnit<T> {
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
            return;
        }

        let callable = self
            .callable
            .lock()
            .take()
            .expect("execute() called more than once on a TimedUnit");

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
            if self
                .timeout_fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(callback) = self.timeout_callback.lock().take() {
                    callback();
                }
            }
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
