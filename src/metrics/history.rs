//! Fixed-capacity FIFO of history points.

use super::snapshot::HistoryPoint;
use std::collections::VecDeque;

/// Number of history points retained.
pub const HISTORY_CAPACITY: usize = 100;

/// Ordered, bounded history. Pushing past capacity evicts the oldest point.
#[derive(Debug, Clone)]
pub struct BoundedHistory {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl Default for BoundedHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl BoundedHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build from persisted points, keeping only the newest `capacity`.
    pub fn from_points(points: Vec<HistoryPoint>, capacity: usize) -> Self {
        let mut history = Self::with_capacity(capacity);
        for point in points {
            history.push(point);
        }
        history
    }

    /// Append a point, returning the evicted one if the history was full.
    pub fn push(&mut self, point: HistoryPoint) -> Option<HistoryPoint> {
        let evicted = if self.points.len() >= self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn first(&self) -> Option<&HistoryPoint> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().cloned().collect()
    }
}
