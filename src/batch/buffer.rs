//! Batch buffer.
//!
//! Not synchronized on its own; the scheduler owns it behind one lock.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub data: T,
    pub added_at: Instant,
}

impl<T> BatchItem<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            added_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAddResult {
    Added { count: usize },
    ShouldFlush { count: usize },
}

impl BatchAddResult {
    pub fn should_flush(&self) -> bool {
        matches!(self, BatchAddResult::ShouldFlush { .. })
    }

    pub fn count(&self) -> usize {
        match self {
            BatchAddResult::Added { count } | BatchAddResult::ShouldFlush { count } => *count,
        }
    }
}

#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: VecDeque<BatchItem<T>>,
    max_batch_size: usize,
    max_queue_time: Duration,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_batch_size: usize, max_queue_time: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_batch_size: max_batch_size.max(1),
            max_queue_time,
        }
    }

    pub fn add(&mut self, item: BatchItem<T>) -> BatchAddResult {
        self.items.push_back(item);
        let count = self.items.len();
        if count >= self.max_batch_size {
            BatchAddResult::ShouldFlush { count }
        } else {
            BatchAddResult::Added { count }
        }
    }

    pub fn push(&mut self, data: T) -> BatchAddResult {
        self.add(BatchItem::new(data))
    }

    /// When the oldest pending item hits its queue time. `None` when the
    /// buffer is empty or the queue time lies beyond what `Instant` can hold.
    pub fn deadline(&self) -> Option<Instant> {
        self.items
            .front()
            .and_then(|item| item.added_at.checked_add(self.max_queue_time))
    }

    /// Size or time trigger reached.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.items.len() >= self.max_batch_size {
            return true;
        }
        self.deadline().is_some_and(|d| d <= now)
    }

    /// Removes the oldest `max_batch_size` items.
    pub fn take_cohort(&mut self) -> Vec<BatchItem<T>> {
        let n = self.items.len().min(self.max_batch_size);
        self.items.drain(..n).collect()
    }

    /// Removes everything, split into cohorts of at most `max_batch_size`.
    pub fn drain_cohorts(&mut self) -> Vec<Vec<BatchItem<T>>> {
        let mut cohorts = Vec::new();
        while !self.items.is_empty() {
            cohorts.push(self.take_cohort());
        }
        cohorts
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
