// THEORY:
// A `RollingWindow` is a fixed-capacity FIFO history: the same sliding window a
// temporal analyzer keeps over its last N observations, lifted into a reusable
// type. Pushing into a full window evicts the oldest entry, so the window always
// holds the most recent `capacity` values in arrival order.

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> RollingWindow<T> {
    /// Creates an empty window. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a value, evicting and returning the oldest one when the window is full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(value);
        evicted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter()
    }
}

impl<T: Clone> RollingWindow<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl RollingWindow<f64> {
    /// Mean of the held values, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().sum::<f64>() / self.entries.len() as f64
    }
}

impl<T: Serialize> Serialize for RollingWindow<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_most_recent_entries_in_order() {
        let capacity = 4;
        let extra = 3;
        let mut window = RollingWindow::new(capacity);
        for i in 0..capacity + extra {
            window.push(i);
        }
        assert_eq!(window.len(), capacity);
        assert_eq!(window.to_vec(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn push_reports_evicted_value() {
        let mut window = RollingWindow::new(2);
        assert_eq!(window.push('a'), None);
        assert_eq!(window.push('b'), None);
        assert_eq!(window.push('c'), Some('a'));
    }

    #[test]
    fn mean_of_empty_window_is_zero() {
        let mut window = RollingWindow::new(3);
        assert_eq!(window.mean(), 0.0);
        window.push(2.0);
        window.push(4.0);
        assert_eq!(window.mean(), 3.0);
    }

    #[test]
    fn zero_capacity_is_promoted_to_one() {
        let mut window = RollingWindow::new(0);
        window.push(1);
        window.push(2);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.to_vec(), vec![2]);
    }
}
