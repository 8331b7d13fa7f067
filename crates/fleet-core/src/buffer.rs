//! Bounded ring buffer for time series
//!
//! Used for snapshot history, pressure readings, pool utilization and agent
//! utilization samples. Append and eviction are both O(1); once the buffer
//! is full the oldest entry is dropped.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Entries that carry their own timestamp
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Fixed-capacity FIFO buffer
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    max_size: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `max_size` entries (minimum one)
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(4_096)),
            max_size,
        }
    }

    /// Append an entry, evicting the oldest when full. Returns the evicted
    /// entry, if any.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Change the capacity, dropping the oldest entries if it shrinks
    pub fn resize(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    /// The most recent `n` entries, oldest first
    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T: Timestamped> RingBuffer<T> {
    /// Entries with a timestamp at or after `since`, oldest first
    pub fn since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &T> {
        // Entries are appended in time order, so scan from the back
        let newer = self
            .entries
            .iter()
            .rev()
            .take_while(|e| e.timestamp() >= since)
            .count();
        self.entries.iter().skip(self.entries.len() - newer)
    }
}
