/// Integration tests for pool autoscaling (scheduler + pool + worker set
/// acting together under real submission load).
///
/// These exercise the scaling control loop with real OS threads and real
/// wall-clock sleeps rather than a mocked clock, as the teacher's
/// `timeout.rs` tests do: bounds are generous rather than tight so a loaded
/// CI box doesn't flake, but the assertions still pin down the direction
/// and rough magnitude of the scaling behavior, not just "it didn't crash".
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskforge_core::pool::ThreadPool;
use taskforge_shared::config::{BackpressureMode, PoolConfig, QueueStrategy};

fn fast_scaling_config() -> PoolConfig {
    PoolConfig {
        min_threads: 1,
        max_threads: 6,
        core_threads: 1,
        initial_threads: 1,
        queue_strategy: QueueStrategy::Fifo,
        max_queue_size: 0,
        default_backpressure: BackpressureMode::Block,
        scale_up_delay: Duration::ZERO,
        scale_down_delay: Duration::ZERO,
        scale_up_step: 2,
        scale_down_step: 1,
        ..PoolConfig::default()
    }
}

/// Scenario 4: a burst of long-running submissions should grow the worker
/// set past `initial_threads` (gated only by the scaling loop's hysteresis
/// and its own 1s tick, not by `scale_up_delay`), then shrink back toward
/// `min_threads` once the burst drains and the queue sits idle.
#[test]
fn test_pool_scales_up_under_sustained_load_then_back_down() {
    let pool = ThreadPool::new(fast_scaling_config(), None);
    pool.start();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));

    // Hold every submitted task open until the test explicitly releases
    // them, so the queue stays saturated long enough for the scaling
    // thread's hysteresis counters to clear their threshold.
    let mut handles = Vec::new();
    for _ in 0..40 {
        let in_flight = in_flight.clone();
        let released = released.clone();
        let handle = pool
            .submit(move || {
                in_flight.fetch_add(1, Ordering::SeqCst);
                while !released.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        handles.push(handle);
    }

    // Give the scaling loop several 1s ticks to observe sustained
    // over-threshold load and act on it.
    std::thread::sleep(Duration::from_millis(4500));
    let scaled_stats = pool.stats();
    assert!(
        scaled_stats.worker_count > 1,
        "expected worker_count to grow past initial_threads under load, got {}",
        scaled_stats.worker_count
    );
    assert!(scaled_stats.worker_count <= 6, "never exceeds max_threads");

    released.store(true, Ordering::Release);
    for handle in handles {
        let _ = handle.get_result();
    }

    // Give the scaling loop enough ticks to clear the down hysteresis
    // window (3 consecutive under-threshold ticks) and scale back down.
    std::thread::sleep(Duration::from_millis(5000));
    let drained_stats = pool.stats();
    assert!(
        drained_stats.worker_count < scaled_stats.worker_count,
        "expected worker_count to shrink after the burst drained: before={}, after={}",
        scaled_stats.worker_count,
        drained_stats.worker_count
    );

    pool.stop();
}

/// Scenario 4 (bound enforcement): scaling never pushes the worker count
/// outside [min_threads, max_threads] regardless of how long a burst runs.
#[test]
fn test_pool_never_scales_past_configured_bounds() {
    let pool = ThreadPool::new(fast_scaling_config(), None);
    pool.start();

    for _ in 0..200 {
        let _ = pool.submit(|| 1 + 1);
    }

    for _ in 0..10 {
        let stats = pool.stats();
        assert!(stats.worker_count >= 1);
        assert!(stats.worker_count <= 6);
        std::thread::sleep(Duration::from_millis(300));
    }

    pool.shutdown(Duration::from_secs(5));
}
