/// Pool facade: the user-facing submission API. Owns the scheduler,
/// the monotonic task-id counter, and (when monitoring is enabled) a map
/// from task id to unit handle used for cancellation, cleanup, and
/// health reporting.
///
/// ```text
/// stopped -> starting -> running -> (pausing -> paused -> running
///                                    | stopping -> stopped) | error
/// ```
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use taskforge_shared::config::PoolConfig;
use taskforge_shared::events::{emit, EventCategory, EventHandler};
use taskforge_shared::ids::TaskIdCounter;

use crate::queue::{self, QueueError, TaskQueue};
use crate::scheduler::Scheduler;
use crate::stats::{self, PoolStats, SubmissionCounters};
use crate::unit::dependent::DependentUnit;
use crate::unit::standard::StandardUnit;
use crate::unit::timed::TimedUnit;
use crate::unit::{priority, ResultHandle, TaskUnit};

/// How often the monitor thread samples pool-level metrics.
const MONITOR_TICK: Duration = Duration::from_millis(1000);
/// How often the monitor thread sweeps the active-task map for entries
/// that have reached a terminal state, and enforces the global task
/// timeout.
const CLEANUP_EVERY_N_TICKS: u32 = 3;

/// Errors the pool facade's own operations can raise.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Submission attempted while the pool isn't `Running`.
    #[error("pool is not running (state: {0:?})")]
    NotRunning(PoolState),

    /// The underlying queue rejected the task (closed, or full under
    /// `exception` backpressure).
    #[error("queue rejected task: {0}")]
    Queue(#[from] QueueError),

    /// `cancel`/`wait_for` referenced a task id the pool has no record
    /// of (monitoring disabled, or the id was already cleaned up).
    #[error("unknown task id {0}")]
    UnknownTask(u64),
}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Pausing = 3,
    Paused = 4,
    Stopping = 5,
    Error = 6,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Stopped,
            1 => PoolState::Starting,
            2 => PoolState::Running,
            3 => PoolState::Pausing,
            4 => PoolState::Paused,
            5 => PoolState::Stopping,
            _ => PoolState::Error,
        }
    }
}

struct AtomicPoolState(AtomicU8);

impl AtomicPoolState {
    fn new(state: PoolState) -> Self {
        AtomicPoolState(AtomicU8::new(state as u8))
    }
    fn load(&self) -> PoolState {
        PoolState::from_u8(self.0.load(Ordering::Acquire))
    }
    fn store(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Running totals the monitor thread maintains across ticks, used to
/// derive peak and throughput figures.
struct MonitorState {
    last_tick: Instant,
    last_completed: u64,
    current_throughput: f64,
    peak_throughput: f64,
    tick_count: u32,
}

/// The user-facing thread pool: submission API, lifecycle state machine,
/// monitoring, and health checking over a [`Scheduler`].
pub struct ThreadPool {
    config: PoolConfig,
    scheduler: Arc<Scheduler>,
    state: AtomicPoolState,
    task_ids: TaskIdCounter,
    /// Populated only when `config.monitoring_enabled`; otherwise
    /// submission skips the bookkeeping entirely.
    tasks: RwLock<HashMap<u64, Arc<dyn TaskUnit>>>,
    counters: SubmissionCounters,
    event_handler: Option<Arc<dyn EventHandler>>,
    stats_handler: Option<Arc<dyn Fn(&PoolStats) + Send + Sync>>,
    start_time: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
    peak_threads: AtomicUsize,
    peak_queue: AtomicUsize,
    monitor: Mutex<MonitorState>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig, event_handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        Self::with_stats_handler(config, event_handler, None)
    }

    pub fn with_stats_handler(
        config: PoolConfig,
        event_handler: Option<Arc<dyn EventHandler>>,
        stats_handler: Option<Arc<dyn Fn(&PoolStats) + Send + Sync>>,
    ) -> Arc<Self> {
        let queue = queue::make_queue(config.queue_strategy, config.max_queue_size);
        let scheduler = Scheduler::new(config.clone(), queue, event_handler.clone());
        Arc::new(ThreadPool {
            config,
            scheduler,
            state: AtomicPoolState::new(PoolState::Stopped),
            task_ids: TaskIdCounter::new(),
            tasks: RwLock::new(HashMap::new()),
            counters: SubmissionCounters::new(),
            event_handler,
            stats_handler,
            start_time: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            peak_threads: AtomicUsize::new(0),
            peak_queue: AtomicUsize::new(0),
            monitor: Mutex::new(MonitorState {
                last_tick: Instant::now(),
                last_completed: 0,
                current_throughput: 0.0,
                peak_throughput: 0.0,
                tick_count: 0,
            }),
            monitor_handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> PoolState {
        self.state.load()
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        self.scheduler.queue()
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        if !matches!(self.state(), PoolState::Stopped | PoolState::Error) {
            return;
        }
        self.state.store(PoolState::Starting);
        *self.start_time.lock() = Some(Instant::now());
        self.scheduler.start();
        self.state.store(PoolState::Running);

        if self.config.monitoring_enabled {
            let pool = self.clone();
            let handle = thread::Builder::new()
                .name("taskforge-pool-monitor".into())
                .spawn(move || pool.monitor_loop())
                .expect("failed to spawn pool monitor thread");
            *self.monitor_handle.lock() = Some(handle);
        }

        emit(&self.event_handler, EventCategory::Lifecycle, "pool started");
    }

    pub fn pause(&self) {
        if self.state() != PoolState::Running {
            return;
        }
        self.state.store(PoolState::Pausing);
        self.scheduler.pause();
        self.state.store(PoolState::Paused);
        emit(&self.event_handler, EventCategory::Lifecycle, "pool paused");
    }

    pub fn resume(&self) {
        if self.state() != PoolState::Paused {
            return;
        }
        self.scheduler.resume();
        self.state.store(PoolState::Running);
        emit(&self.event_handler, EventCategory::Lifecycle, "pool resumed");
    }

    pub fn stop(self: &Arc<Self>) {
        if matches!(self.state(), PoolState::Stopped | PoolState::Stopping) {
            return;
        }
        self.state.store(PoolState::Stopping);
        if let Some(handle) = self.monitor_handle.lock().take() {
            let _ = handle.join();
        }
        self.scheduler.stop();
        self.state.store(PoolState::Stopped);
        emit(&self.event_handler, EventCategory::Lifecycle, "pool stopped");
    }

    pub fn restart(self: &Arc<Self>) {
        self.stop();
        self.start();
    }

    /// Waits for quiescence (no active tasks and an empty queue) up to
    /// `timeout`, then stops regardless, forcing a stop if quiescence was
    /// never observed. Returns whether quiescence was reached before the
    /// forced stop.
    pub fn shutdown(self: &Arc<Self>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiescent = false;
        while Instant::now() < deadline {
            if self.scheduler.active_count() == 0 && self.scheduler.queue().empty() {
                quiescent = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        self.stop();
        quiescent
    }

    // ---------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------

    fn next_id_and_seq(&self) -> (u64, u64) {
        let id = self.task_ids.next();
        (id, id)
    }

    fn require_running(&self) -> Result<(), PoolError> {
        if self.state() != PoolState::Running {
            return Err(PoolError::NotRunning(self.state()));
        }
        Ok(())
    }

    /// Pushes `unit` onto the scheduler's queue, counting a rejection
    /// (closed queue, or full under `exception` backpressure) against
    /// `counters.rejected` before propagating the error.
    fn enqueue(&self, unit: Arc<dyn TaskUnit>) -> Result<(), PoolError> {
        if let Err(e) = self.scheduler.queue().push(unit, self.config.default_backpressure) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    fn track(&self, unit: &Arc<dyn TaskUnit>) {
        if self.config.monitoring_enabled {
            self.tasks.write().insert(unit.id(), unit.clone());
        }
        *self.last_activity.lock() = Instant::now();
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        emit(
            &self.event_handler,
            EventCategory::TaskSubmitted,
            format!("task {} submitted", unit.id()),
        );
    }

    /// Submits a callable at normal priority. Returns a handle whose
    /// `get_result()` blocks until the task reaches a terminal state.
    pub fn submit<T: Send + 'static>(
        &self,
        callable: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Arc<dyn ResultHandle<T>>, PoolError> {
        self.submit_priority(priority::NORMAL, callable)
    }

    pub fn submit_priority<T: Send + 'static>(
        &self,
        priority: i32,
        callable: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Arc<dyn ResultHandle<T>>, PoolError> {
        self.require_running()?;
        let (id, seq) = self.next_id_and_seq();
        let unit = Arc::new(StandardUnit::new(id, None, seq, priority, Box::new(callable)));
        let erased: Arc<dyn TaskUnit> = unit.clone();
        self.enqueue(erased.clone())?;
        self.track(&erased);
        Ok(unit)
    }

    /// If `deadline` elapses before execution starts, the returned
    /// handle's `get_result()` resolves to a timeout error.
    pub fn submit_timeout<T: Send + 'static>(
        &self,
        deadline: Duration,
        callable: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Arc<dyn ResultHandle<T>>, PoolError> {
        self.require_running()?;
        let (id, seq) = self.next_id_and_seq();
        let unit = Arc::new(TimedUnit::new(
            id,
            None,
            seq,
            priority::NORMAL,
            Box::new(callable),
            None,
        ));
        unit.set_deadline(Instant::now() + deadline);
        let erased: Arc<dyn TaskUnit> = unit.clone();
        self.enqueue(erased.clone())?;
        self.track(&erased);
        Ok(unit)
    }

    /// Effective only when the pool's queue is a delay queue; on a FIFO
    /// or priority queue the deadline is recorded but not honored for
    /// dispatch eligibility.
    pub fn submit_delayed<T: Send + 'static>(
        &self,
        delay: Duration,
        callable: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Arc<dyn ResultHandle<T>>, PoolError> {
        self.require_running()?;
        let (id, seq) = self.next_id_and_seq();
        let unit = Arc::new(StandardUnit::new(id, None, seq, priority::NORMAL, Box::new(callable)));
        unit.set_deadline(Instant::now() + delay);
        let erased: Arc<dyn TaskUnit> = unit.clone();
        self.enqueue(erased.clone())?;
        self.track(&erased);
        Ok(unit)
    }

    /// Submits a callable that only becomes dispatchable once every
    /// predecessor has completed.
    pub fn submit_reliance<T: Send + 'static>(
        &self,
        predecessors: Vec<Arc<dyn TaskUnit>>,
        callable: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Arc<dyn ResultHandle<T>>, PoolError> {
        self.require_running()?;
        let (id, seq) = self.next_id_and_seq();
        let unit = Arc::new(DependentUnit::new(
            id,
            None,
            seq,
            priority::NORMAL,
            Box::new(callable),
            predecessors,
        ));
        let erased: Arc<dyn TaskUnit> = unit.clone();
        self.enqueue(erased.clone())?;
        self.track(&erased);
        Ok(unit)
    }

    /// Submits a batch of already-built units, best-effort. Returns the
    /// count actually accepted; only accepted units are tracked and
    /// counted against `counters.submitted`, so a unit `push` rejects or
    /// drops is neither monitored nor orphaned in the `tasks` map.
    pub fn submit_batch(&self, units: Vec<Arc<dyn TaskUnit>>) -> Result<usize, PoolError> {
        self.require_running()?;
        let mode = self.config.default_backpressure;
        let mut accepted = 0;
        for unit in units {
            match self.scheduler.queue().push(unit.clone(), mode) {
                Ok(true) => {
                    self.track(&unit);
                    accepted += 1;
                }
                Ok(false) => {}
                Err(_) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(accepted)
    }

    /// Submits `callables` as independent normal-priority tasks and
    /// returns a handle per callable, in the same order.
    pub fn submit_parallel<T: Send + 'static>(
        &self,
        callables: Vec<Box<dyn FnOnce() -> T + Send>>,
    ) -> Result<Vec<Arc<dyn ResultHandle<T>>>, PoolError> {
        callables
            .into_iter()
            .map(|callable| self.submit(callable))
            .collect()
    }

    // ---------------------------------------------------------------
    // Cancellation and querying
    // ---------------------------------------------------------------

    pub fn cancel(&self, task_id: u64) -> Result<bool, PoolError> {
        let unit = self
            .tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(PoolError::UnknownTask(task_id))?;
        let cancelled = unit.cancel();
        if cancelled {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            emit(
                &self.event_handler,
                EventCategory::TaskCancelled,
                format!("task {task_id} cancelled"),
            );
        }
        Ok(cancelled)
    }

    /// Cancels every currently-tracked task still in `pending`. Requires
    /// monitoring to be enabled (otherwise there is nothing tracked to
    /// cancel here — callers can still cancel via their own handle).
    pub fn cancel_all_pending(&self) -> usize {
        let tasks = self.tasks.read();
        let mut cancelled = 0;
        for unit in tasks.values() {
            if unit.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.counters.cancelled.fetch_add(cancelled as u64, Ordering::Relaxed);
        }
        cancelled
    }

    pub fn wait_for(&self, task_id: u64, timeout: Duration) -> Result<bool, PoolError> {
        let unit = self
            .tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(PoolError::UnknownTask(task_id))?;
        Ok(unit.wait_for(timeout))
    }

    pub fn stats(&self) -> PoolStats {
        let monitor = self.monitor.lock();
        let figures = stats::MonitorFigures {
            peak_threads: self.peak_threads.load(Ordering::Acquire),
            peak_queue: self.peak_queue.load(Ordering::Acquire),
            current_throughput: monitor.current_throughput,
            peak_throughput: monitor.peak_throughput,
            last_activity_secs: self.last_activity.lock().elapsed().as_secs_f64(),
            uptime_secs: self
                .start_time
                .lock()
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        };
        drop(monitor);
        stats::snapshot(&self.scheduler, &self.counters, &figures)
    }

    /// Healthy iff running, the scheduler's own worker count is inside
    /// its configured bounds, and queue utilization is below 95%.
    pub fn health_check(&self) -> bool {
        if self.state() != PoolState::Running {
            return false;
        }
        let total = self.scheduler.worker_count();
        if total < self.config.min_threads || total > self.config.max_threads {
            return false;
        }
        let capacity = self.scheduler.queue().max_size();
        if capacity != 0 {
            let utilization = self.scheduler.queue().size() as f64 / capacity as f64;
            if utilization >= 0.95 {
                return false;
            }
        }
        true
    }

    /// Restarts the scheduler if unhealthy, and rebalances the worker
    /// count into `[min_threads, max_threads]`.
    pub fn auto_repair(self: &Arc<Self>) {
        if self.health_check() {
            return;
        }
        emit(&self.event_handler, EventCategory::Repair, "auto-repair triggered");
        let total = self.scheduler.worker_count();
        if total < self.config.min_threads {
            self.scheduler.scale_up(self.config.min_threads - total);
        } else if total > self.config.max_threads {
            self.scheduler.scale_down(total - self.config.max_threads);
        }
        if self.state() == PoolState::Error {
            self.restart();
        }
    }

    // ---------------------------------------------------------------
    // Monitoring
    // ---------------------------------------------------------------

    fn monitor_loop(self: Arc<Self>) {
        while !matches!(self.state(), PoolState::Stopped | PoolState::Stopping) {
            thread::sleep(MONITOR_TICK);
            if matches!(self.state(), PoolState::Stopped | PoolState::Stopping) {
                return;
            }
            self.monitor_tick();
        }
    }

    fn monitor_tick(&self) {
        let total = self.scheduler.worker_count();
        self.peak_threads.fetch_max(total, Ordering::AcqRel);
        let queue_len = self.scheduler.queue().size();
        self.peak_queue.fetch_max(queue_len, Ordering::AcqRel);

        let snapshot = self.stats();
        let mut monitor = self.monitor.lock();
        let elapsed = monitor.last_tick.elapsed().as_secs_f64().max(0.001);
        let completed_delta = snapshot.executed.saturating_sub(monitor.last_completed);
        monitor.current_throughput = completed_delta as f64 / elapsed;
        monitor.peak_throughput = monitor.peak_throughput.max(monitor.current_throughput);
        monitor.last_completed = snapshot.executed;
        monitor.last_tick = Instant::now();
        monitor.tick_count += 1;
        let run_cleanup = monitor.tick_count % CLEANUP_EVERY_N_TICKS == 0;
        drop(monitor);

        if let Some(handler) = &self.stats_handler {
            handler(&snapshot);
        }

        if run_cleanup {
            self.cleanup_pass();
        }
    }

    /// Drops terminal entries from the tracked-task map and cancels any
    /// still-pending task that has exceeded the configured global task
    /// timeout.
    fn cleanup_pass(&self) {
        let mut removed = 0usize;
        let mut timed_out = 0usize;
        {
            let mut tasks = self.tasks.write();
            tasks.retain(|_, unit| {
                if unit.is_result_ready() {
                    removed += 1;
                    return false;
                }
                if unit.submit_time().elapsed() > self.config.task_timeout {
                    if unit.mark_timeout() {
                        timed_out += 1;
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                }
                true
            });
        }
        if removed > 0 || timed_out > 0 {
            emit(
                &self.event_handler,
                EventCategory::Cleanup,
                format!("cleanup: removed {removed} finished tasks, timed out {timed_out} stale tasks"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_shared::config::QueueStrategy;

    fn test_config() -> PoolConfig {
        let mut config = PoolConfig::default();
        config.min_threads = 1;
        config.max_threads = 2;
        config.initial_threads = 1;
        config.task_timeout = Duration::from_secs(3600);
        config
    }

    #[test]
    fn test_submit_runs_and_returns_result() {
        let pool = ThreadPool::new(test_config(), None);
        pool.start();
        let handle = pool.submit(|| 2 + 2).unwrap();
        assert_eq!(handle.get_result().unwrap(), 4);
        pool.stop();
    }

    #[test]
    fn test_submit_rejected_when_not_running() {
        let pool = ThreadPool::new(test_config(), None);
        let result = pool.submit(|| 1);
        assert!(matches!(result, Err(PoolError::NotRunning(PoolState::Stopped))));
    }

    #[test]
    fn test_fifo_round_trip_preserves_order() {
        // A single FIFO worker must execute submissions in enqueue order.
        let mut config = test_config();
        config.initial_threads = 1;
        config.max_threads = 1;
        let pool = ThreadPool::new(config, None);
        pool.start();

        use std::sync::atomic::AtomicUsize;
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let order = order.clone();
            let completed = completed.clone();
            pool.submit(move || {
                order.lock().push(i);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while completed.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let observed = order.lock();
        let expected: Vec<usize> = (0..100).collect();
        assert_eq!(*observed, expected);
        pool.stop();
    }

    #[test]
    fn test_cancel_before_start_prevents_callable() {
        // A long delayed task cancelled before its deadline elapses must
        // never be dispatched. Requires a delay queue — on FIFO/priority
        // the deadline isn't honored for eligibility (see `submit_delayed`).
        let mut config = test_config();
        config.queue_strategy = QueueStrategy::Delay;
        let pool = ThreadPool::new(config, None);
        pool.start();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let handle = pool
            .submit_delayed(Duration::from_secs(10), move || {
                ran_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();

        let task_id = handle.id();
        assert!(pool.cancel(task_id).unwrap());
        assert!(matches!(handle.get_result(), Err(crate::unit::UnitError::Cancelled(_))));
        assert!(!ran.load(Ordering::SeqCst));
        pool.stop();
    }

    #[test]
    fn test_health_check_false_before_start() {
        let pool = ThreadPool::new(test_config(), None);
        assert!(!pool.health_check());
    }

    #[test]
    fn test_health_check_true_while_running_within_bounds() {
        let pool = ThreadPool::new(test_config(), None);
        pool.start();
        assert!(pool.health_check());
        pool.stop();
    }

    #[test]
    fn test_pause_resume_cycle() {
        let pool = ThreadPool::new(test_config(), None);
        pool.start();
        pool.pause();
        assert_eq!(pool.state(), PoolState::Paused);
        pool.resume();
        assert_eq!(pool.state(), PoolState::Running);
        pool.stop();
    }

    #[test]
    fn test_shutdown_waits_for_quiescence() {
        let pool = ThreadPool::new(test_config(), None);
        pool.start();
        let handle = pool.submit(|| {
            thread::sleep(Duration::from_millis(30));
            1
        });
        assert!(handle.is_ok());
        let quiescent = pool.shutdown(Duration::from_secs(2));
        assert!(quiescent);
    }

    #[test]
    fn test_priority_queue_strategy_preempts() {
        // Scenario 2: with one worker, a critical task enqueued after a
        // burst of normal tasks completes after at most one normal task
        // begins.
        let mut config = test_config();
        config.queue_strategy = QueueStrategy::Priority;
        config.initial_threads = 1;
        config.max_threads = 1;
        let pool = ThreadPool::new(config, None);
        pool.start();

        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let started = started.clone();
            pool.submit(move || {
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
            })
            .unwrap();
        }

        let critical_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let critical_ran_clone = critical_ran.clone();
        let critical_started_at = Arc::new(AtomicUsize::new(0));
        let critical_started_at_clone = critical_started_at.clone();
        let started_clone = started.clone();
        pool.submit_priority(priority::CRITICAL, move || {
            critical_started_at_clone.store(started_clone.load(Ordering::SeqCst), Ordering::SeqCst);
            critical_ran_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !critical_ran.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(critical_ran.load(Ordering::SeqCst));
        assert!(critical_started_at.load(Ordering::SeqCst) <= 1);
        pool.stop();
    }
}
