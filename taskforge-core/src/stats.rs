/// Pool-level statistics: a point-in-time snapshot aggregating per-worker
/// counters with pool-wide submission counts.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::scheduler::Scheduler;

/// Counters incremented at submission/cleanup time, independent of
/// per-worker execution stats (a cancelled, rejected, or timed-out task
/// never reaches a worker).
#[derive(Debug, Default)]
pub(crate) struct SubmissionCounters {
    pub submitted: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub timed_out: AtomicU64,
}

impl SubmissionCounters {
    pub(crate) fn new() -> Self {
        SubmissionCounters::default()
    }
}

/// The monitor-computed figures that live alongside `ThreadPool` itself
/// (peaks, throughput, activity/uptime clocks) rather than in the
/// scheduler or counters — passed in by the caller so `snapshot` stays a
/// pure aggregation function.
pub(crate) struct MonitorFigures {
    pub peak_threads: usize,
    pub peak_queue: usize,
    pub current_throughput: f64,
    pub peak_throughput: f64,
    pub last_activity_secs: f64,
    pub uptime_secs: f64,
}

/// A serializable snapshot suitable for logging, a status endpoint, or a
/// health-check response.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub queue_size: usize,
    pub submitted: u64,
    pub executed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub average_load_factor: f64,
    pub peak_threads: usize,
    pub peak_queue: usize,
    pub current_throughput: f64,
    pub peak_throughput: f64,
    pub last_activity_secs: f64,
    pub uptime_secs: f64,
}

pub(crate) fn snapshot(scheduler: &Scheduler, counters: &SubmissionCounters, monitor: &MonitorFigures) -> PoolStats {
    let workers = scheduler.workers_snapshot();
    let worker_count = workers.len();
    let (executed, failed, load_sum) = workers.iter().fold((0u64, 0u64, 0.0f64), |acc, worker| {
        let snap = worker.stats();
        (
            acc.0 + snap.executed,
            acc.1 + snap.failed,
            acc.2 + worker.load_factor(),
        )
    });

    PoolStats {
        worker_count,
        queue_size: scheduler.queue().size(),
        submitted: counters.submitted.load(Ordering::Relaxed),
        executed,
        failed,
        cancelled: counters.cancelled.load(Ordering::Relaxed),
        rejected: counters.rejected.load(Ordering::Relaxed),
        timed_out: counters.timed_out.load(Ordering::Relaxed),
        average_load_factor: if worker_count == 0 {
            0.0
        } else {
            load_sum / worker_count as f64
        },
        peak_threads: monitor.peak_threads,
        peak_queue: monitor.peak_queue,
        current_throughput: monitor.current_throughput,
        peak_throughput: monitor.peak_throughput,
        last_activity_secs: monitor.last_activity_secs,
        uptime_secs: monitor.uptime_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::fifo::FifoQueue;
    use std::sync::Arc;

    fn zero_monitor() -> MonitorFigures {
        MonitorFigures {
            peak_threads: 0,
            peak_queue: 0,
            current_throughput: 0.0,
            peak_throughput: 0.0,
            last_activity_secs: 0.0,
            uptime_secs: 0.0,
        }
    }

    #[test]
    fn test_snapshot_with_no_workers_reports_zero() {
        let queue: Arc<dyn crate::queue::TaskQueue> = Arc::new(FifoQueue::unbounded());
        let scheduler = Scheduler::new(taskforge_shared::config::PoolConfig::default(), queue, None);
        let counters = SubmissionCounters::new();
        let stats = snapshot(&scheduler, &counters, &zero_monitor());
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.average_load_factor, 0.0);
    }

    #[test]
    fn test_snapshot_reflects_submission_counters() {
        let queue: Arc<dyn crate::queue::TaskQueue> = Arc::new(FifoQueue::unbounded());
        let scheduler = Scheduler::new(taskforge_shared::config::PoolConfig::default(), queue, None);
        let counters = SubmissionCounters::new();
        counters.submitted.fetch_add(3, Ordering::Relaxed);
        counters.cancelled.fetch_add(1, Ordering::Relaxed);
        counters.timed_out.fetch_add(2, Ordering::Relaxed);
        let stats = snapshot(&scheduler, &counters, &zero_monitor());
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.timed_out, 2);
    }

    #[test]
    fn test_snapshot_carries_monitor_figures_through() {
        let queue: Arc<dyn crate::queue::TaskQueue> = Arc::new(FifoQueue::unbounded());
        let scheduler = Scheduler::new(taskforge_shared::config::PoolConfig::default(), queue, None);
        let counters = SubmissionCounters::new();
        let monitor = MonitorFigures {
            peak_threads: 4,
            peak_queue: 10,
            current_throughput: 2.5,
            peak_throughput: 9.0,
            last_activity_secs: 1.5,
            uptime_secs: 120.0,
        };
        let stats = snapshot(&scheduler, &counters, &monitor);
        assert_eq!(stats.peak_threads, 4);
        assert_eq!(stats.peak_queue, 10);
        assert_eq!(stats.peak_throughput, 9.0);
        assert_eq!(stats.uptime_secs, 120.0);
    }
}
