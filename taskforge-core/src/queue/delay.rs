/// Delay task queue: an ordered multiset keyed by deadline timestamp.
/// Delivers in non-decreasing deadline order among currently due items.
/// A background watcher thread wakes blocked consumers as
/// soon as the earliest item becomes due, sleeping otherwise either until
/// that deadline or a bounded maximum of 10 ms, so latency is bounded even
/// if a consumer is parked on a longer wait.
///
/// `pop`'s own loop is independently correct (it re-checks the earliest
/// deadline on every wake, bounded the same way) — the watcher exists so
/// that a *second* consumer blocked on an empty queue is woken promptly
/// once an item the first consumer didn't take becomes due, rather than
/// only on the next push.
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use taskforge_shared::config::BackpressureMode;

use crate::unit::TaskUnit;

use super::{QueueError, QueueStrategy, TaskQueue};

/// Upper bound on how long the watcher (and `pop`'s own loop) will sleep
/// before re-checking the earliest deadline, bounding delivery latency.
const MAX_WATCH_SLEEP: Duration = Duration::from_millis(10);

#[derive(Clone)]
struct DelayEntry {
    deadline: Instant,
    seq: u64,
    unit: Arc<dyn TaskUnit>,
}

impl PartialEq for DelayEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DelayEntry {}

impl PartialOrd for DelayEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<DelayEntry>>,
}

pub struct DelayQueue {
    inner: Mutex<Inner>,
    closed: AtomicBool,
    max_size: AtomicUsize,
    not_empty: Condvar,
    not_full: Condvar,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl DelayQueue {
    pub fn new(max_size: usize) -> Arc<Self> {
        let queue = Arc::new(DelayQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
            }),
            closed: AtomicBool::new(false),
            max_size: AtomicUsize::new(max_size),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            watcher: Mutex::new(None),
        });
        queue.spawn_watcher();
        queue
    }

    pub fn unbounded() -> Arc<Self> {
        Self::new(0)
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let queue = self.clone();
        let handle = thread::Builder::new()
            .name("taskforge-delay-watcher".into())
            .spawn(move || queue.watch_loop())
            .expect("failed to spawn delay queue watcher thread");
        *self.watcher.lock() = Some(handle);
    }

    fn watch_loop(&self) {
        loop {
            let mut inner = self.inner.lock();
            if self.closed.load(Ordering::Acquire) && inner.heap.is_empty() {
                return;
            }
            match inner.heap.peek() {
                None => {
                    self.not_empty.wait_for(&mut inner, MAX_WATCH_SLEEP);
                }
                Some(Reverse(entry)) => {
                    let now = Instant::now();
                    if entry.deadline <= now {
                        drop(inner);
                        self.not_empty.notify_all();
                    } else {
                        let sleep_for = entry.deadline.saturating_duration_since(now).min(MAX_WATCH_SLEEP);
                        self.not_empty.wait_for(&mut inner, sleep_for);
                    }
                }
            }
        }
    }

    fn is_full(&self, len: usize) -> bool {
        let max = self.max_size.load(Ordering::Acquire);
        max != 0 && len >= max
    }

    fn entry_for(unit: &Arc<dyn TaskUnit>) -> DelayEntry {
        DelayEntry {
            deadline: unit.deadline().unwrap_or_else(Instant::now),
            seq: unit.seq(),
            unit: unit.clone(),
        }
    }

    fn evict_latest_deadline(heap: &mut BinaryHeap<Reverse<DelayEntry>>) {
        if heap.is_empty() {
            return;
        }
        let mut items: Vec<DelayEntry> = heap.drain().map(|Reverse(e)| e).collect();
        let max_index = items
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(index, _)| index)
            .expect("non-empty heap has a maximum");
        items.remove(max_index);
        heap.extend(items.into_iter().map(Reverse));
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl TaskQueue for DelayQueue {
    fn push(&self, unit: Arc<dyn TaskUnit>, mode: BackpressureMode) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            if !self.is_full(inner.heap.len()) {
                inner.heap.push(Reverse(Self::entry_for(&unit)));
                drop(inner);
                self.not_empty.notify_all();
                return Ok(true);
            }
            match mode {
                BackpressureMode::Block => {
                    self.not_full.wait(&mut inner);
                }
                BackpressureMode::Overwrite => {
                    Self::evict_latest_deadline(&mut inner.heap);
                    inner.heap.push(Reverse(Self::entry_for(&unit)));
                    drop(inner);
                    self.not_empty.notify_all();
                    return Ok(true);
                }
                BackpressureMode::Exception => return Err(QueueError::Full),
                BackpressureMode::Drop => return Ok(false),
            }
        }
    }

    fn pop(&self) -> Option<Arc<dyn TaskUnit>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(Reverse(entry)) = inner.heap.peek() {
                let deadline = entry.deadline;
                if deadline <= Instant::now() {
                    let Reverse(entry) = inner.heap.pop().expect("peeked entry must pop");
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(entry.unit);
                }
                let wait_for = deadline.saturating_duration_since(Instant::now()).min(MAX_WATCH_SLEEP);
                self.not_empty.wait_for(&mut inner, wait_for);
                continue;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    fn try_pop(&self) -> Option<Arc<dyn TaskUnit>> {
        let mut inner = self.inner.lock();
        let due = matches!(inner.heap.peek(), Some(Reverse(entry)) if entry.deadline <= Instant::now());
        if !due {
            return None;
        }
        let Reverse(entry) = inner.heap.pop().expect("checked due entry exists");
        drop(inner);
        self.not_full.notify_one();
        Some(entry.unit)
    }

    fn try_pop_for(&self, timeout: Duration) -> Option<Arc<dyn TaskUnit>> {
        let deadline_bound = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(Reverse(entry)) = inner.heap.peek() {
                let deadline = entry.deadline;
                if deadline <= Instant::now() {
                    let Reverse(entry) = inner.heap.pop().expect("peeked entry must pop");
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(entry.unit);
                }
            }
            if self.closed.load(Ordering::Acquire) && inner.heap.is_empty() {
                return None;
            }
            let remaining = deadline_bound.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.not_empty.wait_for(&mut inner, remaining.min(MAX_WATCH_SLEEP));
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        drop(inner);
        self.not_full.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.inner.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Release);
        let _guard = self.inner.lock();
        self.not_full.notify_all();
    }

    fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::standard::StandardUnit;

    fn unit_with_deadline(id: u64, deadline: Instant) -> Arc<dyn TaskUnit> {
        let unit = StandardUnit::with_default_priority(id, None, id, Box::new(move || id));
        unit.set_deadline(deadline);
        Arc::new(unit)
    }

    #[test]
    fn test_pop_respects_deadline_order() {
        let queue = DelayQueue::unbounded();
        let now = Instant::now();
        queue
            .push(unit_with_deadline(1, now), BackpressureMode::Block)
            .unwrap();
        queue
            .push(unit_with_deadline(2, now + Duration::from_millis(5)), BackpressureMode::Block)
            .unwrap();

        assert_eq!(queue.pop().unwrap().id(), 1);
        let second = queue.pop().unwrap();
        assert!(second.id() == 2);
        assert!(Instant::now() >= now + Duration::from_millis(5));
    }

    #[test]
    fn test_not_due_item_is_not_returned_by_try_pop() {
        let queue = DelayQueue::unbounded();
        queue
            .push(
                unit_with_deadline(1, Instant::now() + Duration::from_millis(200)),
                BackpressureMode::Block,
            )
            .unwrap();
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_delayed_task_start_time_bounded_after_deadline() {
        let queue = Arc::new(DelayQueue::unbounded());
        let deadline = Instant::now() + Duration::from_millis(100);
        queue
            .push(unit_with_deadline(1, deadline), BackpressureMode::Block)
            .unwrap();

        let popped = queue.pop().unwrap();
        let observed = Instant::now();
        assert!(observed >= deadline);
        assert!(observed < deadline + Duration::from_millis(80));
        assert_eq!(popped.id(), 1);
    }

    #[test]
    fn test_overwrite_evicts_latest_deadline() {
        let queue = DelayQueue::new(2);
        let now = Instant::now();
        queue
            .push(unit_with_deadline(1, now + Duration::from_secs(10)), BackpressureMode::Overwrite)
            .unwrap();
        queue
            .push(unit_with_deadline(2, now), BackpressureMode::Overwrite)
            .unwrap();
        queue
            .push(unit_with_deadline(3, now + Duration::from_secs(5)), BackpressureMode::Overwrite)
            .unwrap();

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.pop().unwrap().id(), 2);
    }

    #[test]
    fn test_close_then_drain_then_null() {
        let queue = DelayQueue::unbounded();
        queue
            .push(unit_with_deadline(1, Instant::now()), BackpressureMode::Block)
            .unwrap();
        queue.close();
        assert_eq!(queue.pop().unwrap().id(), 1);
        assert!(queue.pop().is_none());
    }
}
