use std::collections::{HashSet, VecDeque};

use tokio::sync::watch;

use crate::consts::SEEN_SET_CAPACITY;

/// Bounded record of delivered notification ids, oldest evicted first.
#[derive(Debug)]
pub struct SeenSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
    suppressed: u64,
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::with_capacity(SEEN_SET_CAPACITY)
    }
}

impl SeenSet {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
            suppressed: 0,
        }
    }

    /// `false` for an id already delivered; the set is left untouched.
    /// Otherwise records the id and returns `true`.
    pub fn should_deliver(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            self.suppressed = self.suppressed.saturating_add(1);
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Forgets every delivered id. The suppression count is kept.
    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Server-confirmed unread count. Only ever overwritten from a server push;
/// `None` until the first one arrives.
#[derive(Debug)]
pub struct UnreadCounter {
    tx: watch::Sender<Option<u64>>,
}

impl Default for UnreadCounter {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

impl UnreadCounter {
    pub(crate) fn set_from_server(&self, count: u64) {
        self.tx.send_replace(Some(count));
    }

    pub(crate) fn reset(&self) {
        self.tx.send_if_modified(|count| count.take().is_some());
    }

    pub fn get(&self) -> Option<u64> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_suppressed() {
        let mut seen = SeenSet::default();
        assert!(seen.should_deliver("n1"));
        assert!(!seen.should_deliver("n1"));
        assert!(seen.should_deliver("n2"));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.suppressed(), 1);
    }

    #[test]
    fn oldest_id_is_evicted_at_capacity() {
        let mut seen = SeenSet::default();
        for index in 0..SEEN_SET_CAPACITY {
            assert!(seen.should_deliver(&format!("n{index}")));
        }
        assert_eq!(seen.len(), SEEN_SET_CAPACITY);

        assert!(seen.should_deliver("overflow"));
        assert_eq!(seen.len(), SEEN_SET_CAPACITY);
        assert!(!seen.contains("n0"));
        assert!(seen.contains("n1"));
        assert!(!seen.should_deliver("n1"));

        // Outside the retention window the id counts as new again.
        assert!(seen.should_deliver("n0"));
    }

    #[test]
    fn duplicate_check_does_not_refresh_position() {
        let mut seen = SeenSet::with_capacity(2);
        assert!(seen.should_deliver("a"));
        assert!(seen.should_deliver("b"));
        assert!(!seen.should_deliver("a"));
        assert!(seen.should_deliver("c"));
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
    }

    #[test]
    fn unread_counter_overwrites() {
        let counter = UnreadCounter::default();
        let mut rx = counter.subscribe();
        assert_eq!(counter.get(), None);
        counter.set_from_server(5);
        counter.set_from_server(2);
        assert_eq!(counter.get(), Some(2));
        assert_eq!(*rx.borrow_and_update(), Some(2));
    }

    #[test]
    fn clearing_forgets_ids_and_count() {
        let mut seen = SeenSet::default();
        assert!(seen.should_deliver("n1"));
        assert!(!seen.should_deliver("n1"));
        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.should_deliver("n1"));
        assert_eq!(seen.suppressed(), 1);

        let counter = UnreadCounter::default();
        counter.set_from_server(4);
        counter.reset();
        assert_eq!(counter.get(), None);
    }
}
