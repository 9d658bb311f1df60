/// Task queue: three concrete shapes — FIFO, priority, delay —
/// sharing one interface, all thread-safe, all respecting a monotonic
/// `closed` flag and a dynamically adjustable `max_size`.
pub mod delay;
pub mod fifo;
pub mod priority;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use taskforge_shared::config::BackpressureMode;

use crate::unit::TaskUnit;

pub use taskforge_shared::config::QueueStrategy;

/// Errors a queue's own operations can raise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,
}

/// The shared contract FIFO/priority/delay queues implement.
pub trait TaskQueue: Send + Sync {
    /// Enqueues one unit under the given backpressure policy. Returns
    /// `Ok(true)` if accepted, `Ok(false)` if dropped (only possible under
    /// [`BackpressureMode::Drop`]), or an error for `Closed`/`Full`.
    fn push(&self, unit: Arc<dyn TaskUnit>, mode: BackpressureMode) -> Result<bool, QueueError>;

    /// Best-effort batch push; returns the count actually accepted.
    fn push_batch(&self, units: Vec<Arc<dyn TaskUnit>>, mode: BackpressureMode) -> usize {
        units
            .into_iter()
            .filter(|_| true)
            .map(|unit| self.push(unit, mode).unwrap_or(false))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Blocks until an eligible item is available, or the queue is closed
    /// and empty (returns `None`).
    fn pop(&self) -> Option<Arc<dyn TaskUnit>>;

    /// Blocks for at least one eligible item, then returns up to `n`
    /// currently eligible items.
    fn pop_batch(&self, n: usize) -> Vec<Arc<dyn TaskUnit>> {
        let mut batch = Vec::with_capacity(n);
        if let Some(first) = self.pop() {
            batch.push(first);
        } else {
            return batch;
        }
        while batch.len() < n {
            match self.try_pop() {
                Some(unit) => batch.push(unit),
                None => break,
            }
        }
        batch
    }

    /// Non-blocking pop.
    fn try_pop(&self) -> Option<Arc<dyn TaskUnit>>;

    /// Bounded-blocking pop.
    fn try_pop_for(&self, timeout: Duration) -> Option<Arc<dyn TaskUnit>>;

    fn size(&self) -> usize;

    fn empty(&self) -> bool {
        self.size() == 0
    }

    fn clear(&self);

    /// Monotonic: once closed, stays closed.
    fn close(&self);

    fn closed(&self) -> bool;

    fn set_max_size(&self, max_size: usize);

    /// Current capacity; 0 means unbounded.
    fn max_size(&self) -> usize;

    fn strategy(&self) -> QueueStrategy;
}

/// Builds the configured queue shape. The delay queue owns a background
/// watcher thread and so is constructed directly as an `Arc` (it spawns
/// the thread as part of construction); FIFO and priority queues have no
/// such requirement and are wrapped here for a uniform return type.
pub fn make_queue(strategy: QueueStrategy, max_size: usize) -> Arc<dyn TaskQueue> {
    match strategy {
        QueueStrategy::Fifo => Arc::new(fifo::FifoQueue::new(max_size)),
        QueueStrategy::Priority => Arc::new(priority::PriorityQueue::new(max_size)),
        QueueStrategy::Delay => delay::DelayQueue::new(max_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_queue_returns_matching_strategy() {
        assert_eq!(make_queue(QueueStrategy::Fifo, 0).strategy(), QueueStrategy::Fifo);
        assert_eq!(make_queue(QueueStrategy::Priority, 0).strategy(), QueueStrategy::Priority);
        assert_eq!(make_queue(QueueStrategy::Delay, 0).strategy(), QueueStrategy::Delay);
    }
}
