/// Worker: a long-running thread dequeuing and executing units, with
/// adaptive polling so it backs off under sustained empty polls and
/// recovers immediately once work resumes.
///
/// ```text
/// on_start_callback()
/// loop while not stopping:
///     task = queue.pop_with_adaptive_timeout()
///     if task: execute(task) else: idle_wait()
/// on_stop_callback()
/// ```
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use taskforge_shared::events::{emit, EventCategory, EventHandler};

use crate::queue::TaskQueue;
use crate::unit::TaskUnit;

/// Base poll timeout; adaptive polling adds up to another 50ms scaled by
/// load factor.
const BASE_POLL_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_ADAPTIVE_BONUS: Duration = Duration::from_millis(50);
/// EMA smoothing factor for the load signal (1 on a successful pop, 0 on
/// an empty poll).
const LOAD_EMA_ALPHA: f64 = 0.1;
/// Idle sleep grows by `empty_polls / 10` ms, capped here.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Error = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            3 => WorkerState::Stopped,
            _ => WorkerState::Error,
        }
    }
}

#[derive(Debug)]
struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    fn new(state: WorkerState) -> Self {
        AtomicWorkerState(AtomicU8::new(state as u8))
    }
    fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }
    fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Executed/failed counters and accumulated exec/idle time. Snapshot via
/// [`WorkerStats::snapshot`] for reporting; individual fields are atomics
/// updated from the worker thread only, read from any thread.
#[derive(Debug)]
pub struct WorkerStats {
    executed: AtomicU64,
    failed: AtomicU64,
    exec_micros: AtomicU64,
    idle_micros: AtomicU64,
    start_time: Instant,
    last_task_micros_since_start: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerStatsSnapshot {
    pub executed: u64,
    pub failed: u64,
    pub exec_micros: u64,
    pub idle_micros: u64,
    pub uptime: Duration,
}

impl WorkerStats {
    fn new() -> Self {
        WorkerStats {
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            exec_micros: AtomicU64::new(0),
            idle_micros: AtomicU64::new(0),
            start_time: Instant::now(),
            last_task_micros_since_start: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            exec_micros: self.exec_micros.load(Ordering::Relaxed),
            idle_micros: self.idle_micros.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed(),
        }
    }
}

/// Callbacks a caller may install around a worker's lifecycle and each
/// executed task.
pub struct WorkerCallbacks {
    pub on_start: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_stop: Option<Box<dyn Fn() + Send + Sync>>,
    pub before_task: Option<Box<dyn Fn(&dyn TaskUnit) + Send + Sync>>,
    pub after_task: Option<Box<dyn Fn(&dyn TaskUnit) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl Default for WorkerCallbacks {
    fn default() -> Self {
        WorkerCallbacks {
            on_start: None,
            on_stop: None,
            before_task: None,
            after_task: None,
            on_error: None,
        }
    }
}

/// Adaptive load tracking: an EMA of 1 (success) / 0 (empty poll) and a
/// consecutive-empty-poll counter driving the idle sleep ramp.
struct AdaptiveLoad {
    ema: Mutex<f64>,
    empty_polls: AtomicU64,
}

impl AdaptiveLoad {
    fn new() -> Self {
        AdaptiveLoad {
            ema: Mutex::new(0.0),
            empty_polls: AtomicU64::new(0),
        }
    }

    fn record_success(&self) {
        let mut ema = self.ema.lock();
        *ema = LOAD_EMA_ALPHA * 1.0 + (1.0 - LOAD_EMA_ALPHA) * *ema;
        self.empty_polls.store(0, Ordering::Relaxed);
    }

    fn record_empty(&self) {
        let mut ema = self.ema.lock();
        *ema = LOAD_EMA_ALPHA * 0.0 + (1.0 - LOAD_EMA_ALPHA) * *ema;
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    fn load_factor(&self) -> f64 {
        *self.ema.lock()
    }

    fn pop_timeout(&self) -> Duration {
        let factor = self.load_factor().clamp(0.0, 1.0);
        BASE_POLL_TIMEOUT + MAX_ADAPTIVE_BONUS.mul_f64(factor)
    }

    fn idle_sleep(&self) -> Duration {
        let polls = self.empty_polls.load(Ordering::Relaxed);
        let millis = polls / 10;
        Duration::from_millis(millis).min(MAX_IDLE_SLEEP)
    }
}

/// Resets an `AtomicBool` to `false` when dropped, so `execute_one`'s
/// early-return paths (pre-start timeout) still clear `busy`.
struct ResetOnDrop<'a>(&'a std::sync::atomic::AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One worker thread bound to a shared queue.
pub struct Worker {
    name: String,
    queue: Arc<dyn TaskQueue>,
    state: AtomicWorkerState,
    stats: WorkerStats,
    load: AdaptiveLoad,
    event_handler: Option<Arc<dyn EventHandler>>,
    stop_requested: std::sync::atomic::AtomicBool,
    paused: std::sync::atomic::AtomicBool,
    /// True only while a unit is actually executing, distinct from
    /// `state()` which stays `Running` for the thread's whole lifetime.
    /// The scheduler's `util_threads` sample needs "currently executing"
    /// rather than "thread is alive".
    busy: std::sync::atomic::AtomicBool,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        event_handler: Option<Arc<dyn EventHandler>>,
    ) -> Arc<Self> {
        Arc::new(Worker {
            name: name.into(),
            queue,
            state: AtomicWorkerState::new(WorkerState::Idle),
            stats: WorkerStats::new(),
            load: AdaptiveLoad::new(),
            event_handler,
            stop_requested: std::sync::atomic::AtomicBool::new(false),
            paused: std::sync::atomic::AtomicBool::new(false),
            busy: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn load_factor(&self) -> f64 {
        self.load.load_factor()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), WorkerState::Running)
    }

    /// True only while this worker is currently executing a unit.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Spawns the worker's OS thread and runs its poll loop until
    /// `request_stop` is observed.
    pub fn spawn(self: &Arc<Self>, callbacks: Arc<WorkerCallbacks>) -> JoinHandle<()> {
        let worker = self.clone();
        thread::Builder::new()
            .name(format!("taskforge-worker-{}", self.name))
            .spawn(move || worker.run(callbacks))
            .expect("failed to spawn worker thread")
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.state.store(WorkerState::Stopping);
    }

    fn run(self: Arc<Self>, callbacks: Arc<WorkerCallbacks>) {
        self.state.store(WorkerState::Running);
        if let Some(on_start) = &callbacks.on_start {
            on_start();
        }

        while !self.stop_requested.load(Ordering::Acquire) {
            if self.is_paused() {
                thread::sleep(MAX_IDLE_SLEEP);
                continue;
            }
            let timeout = self.load.pop_timeout();
            match self.queue.try_pop_for(timeout) {
                Some(unit) if !unit.are_dependencies_satisfied() => {
                    // A dependent unit whose predecessors haven't finished
                    // yet must not be dispatched; re-enqueue it rather than
                    // drop it on the floor — `Block` waits for room instead
                    // of losing the unit under a momentarily-full queue,
                    // and unblocks as soon as the queue closes.
                    self.load.record_empty();
                    if self
                        .queue
                        .push(unit, taskforge_shared::config::BackpressureMode::Block)
                        .is_err()
                    {
                        // Queue closed while requeuing; nothing left to
                        // dispatch this unit onto.
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Some(unit) => {
                    self.load.record_success();
                    self.execute_one(&unit, &callbacks);
                }
                None => {
                    if self.queue.closed() && self.queue.empty() {
                        break;
                    }
                    self.load.record_empty();
                    let idle = self.load.idle_sleep();
                    let idle_start = Instant::now();
                    if !idle.is_zero() {
                        thread::sleep(idle);
                    }
                    self.stats
                        .idle_micros
                        .fetch_add(idle_start.elapsed().as_micros() as u64, Ordering::Relaxed);
                }
            }
        }

        if let Some(on_stop) = &callbacks.on_stop {
            on_stop();
        }
        self.state.store(WorkerState::Stopped);
    }

    fn execute_one(&self, unit: &Arc<dyn TaskUnit>, callbacks: &WorkerCallbacks) {
        self.busy.store(true, Ordering::Release);
        let _reset_busy = ResetOnDrop(&self.busy);

        if let Some(before) = &callbacks.before_task {
            before(unit.as_ref());
        }

        if let Some(deadline) = unit.deadline() {
            if deadline <= Instant::now() && unit.state() == crate::unit::TaskState::Pending {
                unit.mark_timeout();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                emit(
                    &self.event_handler,
                    EventCategory::Queue,
                    format!("task {} timed out before execution", unit.id()),
                );
                if let Some(after) = &callbacks.after_task {
                    after(unit.as_ref());
                }
                return;
            }
        }

        let started = Instant::now();
        unit.clone().execute();
        let elapsed = started.elapsed();
        self.stats
            .exec_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.stats
            .last_task_micros_since_start
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        match unit.state() {
            crate::unit::TaskState::Completed => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
            }
            crate::unit::TaskState::Failed => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let message = format!("task {} failed during execution", unit.id());
                if let Some(on_error) = &callbacks.on_error {
                    on_error(&message);
                }
                emit(&self.event_handler, EventCategory::Error, message);
            }
            _ => {}
        }

        if let Some(after) = &callbacks.after_task {
            after(unit.as_ref());
        }
    }
}
