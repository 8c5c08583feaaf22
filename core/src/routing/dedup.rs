// Dedup set — (message id, sender) pairs this node already processed
//
// Bounded with FIFO eviction: once full, recording a new pair forgets the
// oldest one.

use std::collections::{HashSet, VecDeque};

use crate::identity::PeerIdentity;
use crate::message::MessageId;

pub type DedupKey = (MessageId, PeerIdentity);

/// Default number of pairs remembered
pub const DEFAULT_DEDUP_CAPACITY: usize = 4_096;

#[derive(Debug)]
pub struct DedupSet {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a pair. Returns true the first time it is seen.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);

        while self.seen.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            } else {
                break;
            }
        }
        true
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_once() {
        let mut set = DedupSet::default();
        let sender = PeerIdentity::random();
        assert!(set.insert((1, sender)));
        assert!(!set.insert((1, sender)));
        assert!(set.insert((1, PeerIdentity::random())));
        assert!(set.insert((2, sender)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut set = DedupSet::new(3);
        let sender = PeerIdentity::random();
        for id in 0..4 {
            set.insert((id, sender));
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains(&(0, sender)));
        assert!(set.contains(&(1, sender)));
        assert!(set.contains(&(3, sender)));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut set = DedupSet::new(0);
        assert_eq!(set.capacity(), 1);
        assert!(set.insert((5, PeerIdentity::nil())));
        assert_eq!(set.len(), 1);
    }
}
