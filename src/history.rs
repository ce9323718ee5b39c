//! Bounded in-memory history of completed test results.

use crate::results::TestResult;
use crate::stats::mean_f64;

/// Fixed-capacity ring buffer of [`TestResult`].
///
/// Insertion is O(1): once full, the write cursor wraps and the oldest
/// entry is overwritten in place. Single-writer by `&mut self`; wrap in
/// a lock for concurrent access.
#[derive(Debug)]
pub struct HistoryStore {
    slots: Vec<TestResult>,
    capacity: usize,
    /// Next physical slot to overwrite once the buffer has wrapped.
    cursor: usize,
}

impl HistoryStore {
    /// Create a store holding at most `capacity` results.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self { slots: Vec::with_capacity(capacity), capacity, cursor: 0 }
    }

    /// Record a result, overwriting the oldest entry when full.
    pub fn add(&mut self, result: TestResult) {
        if self.slots.len() < self.capacity {
            self.slots.push(result);
        } else {
            self.slots[self.cursor] = result;
            self.cursor = (self.cursor + 1) % self.capacity;
        }
    }

    /// All stored results in chronological order, oldest first.
    ///
    /// Reconstructs logical order from the physical ring: once wrapped,
    /// the cursor points at the oldest entry.
    pub fn all(&self) -> Vec<&TestResult> {
        if self.slots.len() < self.capacity {
            return self.slots.iter().collect();
        }

        self.slots[self.cursor..]
            .iter()
            .chain(self.slots[..self.cursor].iter())
            .collect()
    }

    /// The most recently recorded result, if any.
    pub fn latest(&self) -> Option<&TestResult> {
        self.all().last().copied()
    }

    /// Mean download throughput across stored results.
    pub fn average_download_mbps(&self) -> Option<f64> {
        let speeds: Vec<f64> =
            self.slots.iter().map(|r| r.download_mbps).collect();
        mean_f64(&speeds)
    }

    /// Mean upload throughput across stored results.
    pub fn average_upload_mbps(&self) -> Option<f64> {
        let speeds: Vec<f64> = self.slots.iter().map(|r| r.upload_mbps).collect();
        mean_f64(&speeds)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ServerSnapshot, TestResult};
    use std::time::Duration;

    fn result(ping_ms: f64) -> TestResult {
        TestResult::new(
            ServerSnapshot {
                id: 1,
                name: "Testville".to_string(),
                sponsor: "Example ISP".to_string(),
            },
            None,
            ping_ms,
            ping_ms * 10.0,
            ping_ms * 2.0,
            1_000_000,
            200_000,
            Duration::from_secs(20),
        )
    }

    fn pings(store: &HistoryStore) -> Vec<f64> {
        store.all().iter().map(|r| r.ping_ms).collect()
    }

    #[test]
    fn test_add_below_capacity_keeps_insertion_order() {
        let mut store = HistoryStore::new(3);
        store.add(result(1.0));
        store.add(result(2.0));

        assert_eq!(store.len(), 2);
        assert_eq!(pings(&store), vec![1.0, 2.0]);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut store = HistoryStore::new(3);
        for ping in [1.0, 2.0, 3.0, 4.0, 5.0] {
            store.add(result(ping));
        }

        assert_eq!(store.len(), 3);
        assert_eq!(pings(&store), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_chronological_order_across_multiple_wraps() {
        let mut store = HistoryStore::new(3);
        for ping in 1..=8 {
            store.add(result(ping as f64));
        }

        assert_eq!(pings(&store), vec![6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_latest() {
        let mut store = HistoryStore::new(2);
        assert!(store.latest().is_none());

        store.add(result(1.0));
        store.add(result(2.0));
        store.add(result(3.0));
        assert_eq!(store.latest().unwrap().ping_ms, 3.0);
    }

    #[test]
    fn test_averages() {
        let mut store = HistoryStore::new(4);
        assert!(store.average_download_mbps().is_none());

        store.add(result(1.0)); // download 10, upload 2
        store.add(result(3.0)); // download 30, upload 6

        assert!((store.average_download_mbps().unwrap() - 20.0).abs() < 1e-9);
        assert!((store.average_upload_mbps().unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_one() {
        let mut store = HistoryStore::new(1);
        store.add(result(1.0));
        store.add(result(2.0));

        assert_eq!(pings(&store), vec![2.0]);
        assert_eq!(store.capacity(), 1);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_capacity_panics() {
        HistoryStore::new(0);
    }
}
