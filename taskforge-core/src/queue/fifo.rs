/// FIFO task queue: an ordered sequence of unit handles. Dequeue order
/// equals enqueue order.
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskforge_shared::config::BackpressureMode;

use crate::unit::TaskUnit;

use super::{QueueError, QueueStrategy, TaskQueue};

pub struct FifoQueue {
    data: Mutex<VecDeque<Arc<dyn TaskUnit>>>,
    closed: AtomicBool,
    max_size: AtomicUsize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl FifoQueue {
    pub fn new(max_size: usize) -> Self {
        FifoQueue {
            data: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            max_size: AtomicUsize::new(max_size),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn is_full(&self, len: usize) -> bool {
        let max = self.max_size.load(Ordering::Acquire);
        max != 0 && len >= max
    }
}

impl TaskQueue for FifoQueue {
    fn push(&self, unit: Arc<dyn TaskUnit>, mode: BackpressureMode) -> Result<bool, QueueError> {
        let mut data = self.data.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            if !self.is_full(data.len()) {
                data.push_back(unit);
                drop(data);
                self.not_empty.notify_one();
                return Ok(true);
            }
            match mode {
                BackpressureMode::Block => {
                    self.not_full.wait(&mut data);
                }
                BackpressureMode::Overwrite => {
                    // Newest-at-tail eviction for a FIFO shape.
                    data.pop_back();
                    data.push_back(unit);
                    drop(data);
                    self.not_empty.notify_one();
                    return Ok(true);
                }
                BackpressureMode::Exception => return Err(QueueError::Full),
                BackpressureMode::Drop => return Ok(false),
            }
        }
    }

    fn pop(&self) -> Option<Arc<dyn TaskUnit>> {
        let mut data = self.data.lock();
        loop {
            if let Some(unit) = data.pop_front() {
                drop(data);
                self.not_full.notify_one();
                return Some(unit);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut data);
        }
    }

    fn try_pop(&self) -> Option<Arc<dyn TaskUnit>> {
        let mut data = self.data.lock();
        let unit = data.pop_front();
        if unit.is_some() {
            drop(data);
            self.not_full.notify_one();
        }
        unit
    }

    fn try_pop_for(&self, timeout: Duration) -> Option<Arc<dyn TaskUnit>> {
        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();
        loop {
            if let Some(unit) = data.pop_front() {
                drop(data);
                self.not_full.notify_one();
                return Some(unit);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.not_empty.wait_for(&mut data, remaining);
        }
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn clear(&self) {
        let mut data = self.data.lock();
        data.clear();
        drop(data);
        self.not_full.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.data.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Release);
        let _guard = self.data.lock();
        self.not_full.notify_all();
    }

    fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::standard::StandardUnit;

    fn unit(id: u64) -> Arc<dyn TaskUnit> {
        Arc::new(StandardUnit::with_default_priority(id, None, id, Box::new(move || id)))
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = FifoQueue::unbounded();
        for id in 0..10 {
            queue.push(unit(id), BackpressureMode::Block).unwrap();
        }
        for id in 0..10 {
            assert_eq!(queue.pop().unwrap().id(), id);
        }
    }

    #[test]
    fn test_closed_queue_rejects_push_and_drains() {
        let queue = FifoQueue::unbounded();
        queue.push(unit(1), BackpressureMode::Block).unwrap();
        queue.close();
        assert!(matches!(
            queue.push(unit(2), BackpressureMode::Block),
            Err(QueueError::Closed)
        ));
        // Draining: the item enqueued before close() is still returned.
        assert_eq!(queue.pop().unwrap().id(), 1);
        // Now empty and closed: null handle.
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_drop_mode_does_not_block() {
        let queue = FifoQueue::new(1);
        queue.push(unit(1), BackpressureMode::Drop).unwrap();
        let accepted = queue.push(unit(2), BackpressureMode::Drop).unwrap();
        assert!(!accepted);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_full_exception_mode_errors() {
        let queue = FifoQueue::new(1);
        queue.push(unit(1), BackpressureMode::Exception).unwrap();
        assert!(matches!(
            queue.push(unit(2), BackpressureMode::Exception),
            Err(QueueError::Full)
        ));
    }

    #[test]
    fn test_overwrite_never_exceeds_max_size() {
        let queue = FifoQueue::new(2);
        for id in 0..10 {
            queue.push(unit(id), BackpressureMode::Overwrite).unwrap();
            assert!(queue.size() <= 2);
        }
    }

    #[test]
    fn test_try_pop_for_times_out_on_empty() {
        let queue = FifoQueue::unbounded();
        assert!(queue.try_pop_for(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_block_push_unblocks_after_pop() {
        let queue = Arc::new(FifoQueue::new(1));
        queue.push(unit(1), BackpressureMode::Block).unwrap();

        let queue_clone = queue.clone();
        let handle = std::thread::spawn(move || {
            queue_clone.push(unit(2), BackpressureMode::Block).unwrap();
        });

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.pop().unwrap().id(), 1);
        handle.join().unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_pop_batch_returns_available_items() {
        let queue = FifoQueue::unbounded();
        for id in 0..5 {
            queue.push(unit(id), BackpressureMode::Block).unwrap();
        }
        let batch = queue.pop_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.size(), 2);
    }
}
