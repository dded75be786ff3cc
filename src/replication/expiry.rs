//! TTL priority queue shared by the batch, lock and key-session registries.
//!
//! Entries are invalidated lazily: extending a TTL pushes a new deadline and
//! leaves the old one in the heap. Callers re-check the resource's current
//! deadline before acting on a popped key.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tokio::time::Instant;

#[derive(Debug)]
pub struct ExpiryQueue<K: Ord> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord> Default for ExpiryQueue<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }
}

impl<K: Ord> ExpiryQueue<K> {
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.heap.push(Reverse((deadline, key)));
    }

    /// Remove and return every key whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                due.push(key);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pops_in_deadline_order() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::default();
        queue.schedule(3u64, now + Duration::from_secs(3));
        queue.schedule(1u64, now + Duration::from_secs(1));
        queue.schedule(2u64, now + Duration::from_secs(2));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.pop_due(now).is_empty());
        assert_eq!(queue.pop_due(now + Duration::from_secs(2)), vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), vec![3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_deadlines_are_still_returned() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::default();
        queue.schedule(7u64, now + Duration::from_secs(1));
        queue.schedule(7u64, now + Duration::from_secs(5));

        // The caller decides the first pop is stale
        assert_eq!(queue.pop_due(now + Duration::from_secs(1)), vec![7]);
        assert_eq!(queue.pop_due(now + Duration::from_secs(5)), vec![7]);
    }
}
