/// Priority task queue: an ordered multiset keyed by `priority` (higher
/// first); ties resolved in insertion order.
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskforge_shared::config::BackpressureMode;

use crate::unit::TaskUnit;

use super::{QueueError, QueueStrategy, TaskQueue};

struct HeapEntry {
    priority: i32,
    seq: u64,
    unit: Arc<dyn TaskUnit>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: the "greatest" element pops first.
        // Higher priority must pop first; among equal priorities, the
        // entry inserted earlier (smaller seq) must pop first, so we
        // reverse the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct PriorityQueue {
    data: Mutex<BinaryHeap<HeapEntry>>,
    closed: AtomicBool,
    max_size: AtomicUsize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        PriorityQueue {
            data: Mutex::new(BinaryHeap::new()),
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
        let max = self.max_size.load(AtomicOrdering::Acquire);
        max != 0 && len >= max
    }

    fn entry_for(unit: &Arc<dyn TaskUnit>) -> HeapEntry {
        HeapEntry {
            priority: unit.priority(),
            seq: unit.seq(),
            unit: unit.clone(),
        }
    }

    /// Removes and returns the lowest-priority entry (ties broken by the
    /// most recently inserted), used by `overwrite` backpressure.
    fn evict_lowest_priority(heap: &mut BinaryHeap<HeapEntry>) {
        if heap.is_empty() {
            return;
        }
        let mut items: Vec<HeapEntry> = heap.drain().collect();
        let min_index = items
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(index, _)| index)
            .expect("non-empty heap has a minimum");
        items.remove(min_index);
        heap.extend(items);
    }
}

impl TaskQueue for PriorityQueue {
    fn push(&self, unit: Arc<dyn TaskUnit>, mode: BackpressureMode) -> Result<bool, QueueError> {
        let mut data = self.data.lock();
        loop {
            if self.closed.load(AtomicOrdering::Acquire) {
                return Err(QueueError::Closed);
            }
            if !self.is_full(data.len()) {
                data.push(Self::entry_for(&unit));
                drop(data);
                self.not_empty.notify_one();
                return Ok(true);
            }
            match mode {
                BackpressureMode::Block => {
                    self.not_full.wait(&mut data);
                }
                BackpressureMode::Overwrite => {
                    Self::evict_lowest_priority(&mut data);
                    data.push(Self::entry_for(&unit));
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
            if let Some(entry) = data.pop() {
                drop(data);
                self.not_full.notify_one();
                return Some(entry.unit);
            }
            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut data);
        }
    }

    fn try_pop(&self) -> Option<Arc<dyn TaskUnit>> {
        let mut data = self.data.lock();
        let entry = data.pop();
        if entry.is_some() {
            drop(data);
            self.not_full.notify_one();
        }
        entry.map(|e| e.unit)
    }

    fn try_pop_for(&self, timeout: Duration) -> Option<Arc<dyn TaskUnit>> {
        let deadline = Instant::now() + timeout;
        let mut data = self.data.lock();
        loop {
            if let Some(entry) = data.pop() {
                drop(data);
                self.not_full.notify_one();
                return Some(entry.unit);
            }
            if self.closed.load(AtomicOrdering::Acquire) {
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
        self.closed.store(true, AtomicOrdering::Release);
        let _guard = self.data.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, AtomicOrdering::Release);
        let _guard = self.data.lock();
        self.not_full.notify_all();
    }

    fn max_size(&self) -> usize {
        self.max_size.load(AtomicOrdering::Acquire)
    }

    fn strategy(&self) -> QueueStrategy {
        QueueStrategy::Priority
    }
}
