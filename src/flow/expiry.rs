//! Session storage with lazily invalidated expiration
//!
//! A map of live sessions plus a min-heap of `(expires_at, key)` entries.
//! Refreshing a session pushes a new entry instead of updating the old one;
//! the stale entry is recognised and dropped when it is popped because its
//! deadline no longer equals the session's stored deadline.

use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Longest timeout a session or sweep can be configured with (30 days)
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 3600);

/// `now + timeout`, with the timeout capped at [`MAX_TIMEOUT`]
pub fn deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(MAX_TIMEOUT)).unwrap_or(now)
}

/// A session that carries its own deadline
pub trait Expiring {
    fn expires_at(&self) -> Instant;
}

/// Heap entry; ordered by deadline only
#[derive(Debug, Clone)]
pub struct ExpirationEntry<K> {
    pub expires_at: Instant,
    pub key: K,
}

impl<K> PartialEq for ExpirationEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl<K> Eq for ExpirationEntry<K> {}

impl<K> PartialOrd for ExpirationEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ExpirationEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at.cmp(&other.expires_at)
    }
}

/// Harvest counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    /// Entries popped from the heap
    pub popped: usize,
    /// Popped entries that no longer matched a live session
    pub stale: usize,
    /// Sessions removed
    pub expired: usize,
}

/// Map plus expiration heap. Not synchronized; owners wrap it in a lock.
#[derive(Debug)]
pub struct SessionStore<K, S> {
    sessions: HashMap<K, S>,
    heap: BinaryHeap<Reverse<ExpirationEntry<K>>>,
}

impl<K, S> Default for SessionStore<K, S>
where
    K: Eq + Hash + Clone,
    S: Expiring,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> SessionStore<K, S>
where
    K: Eq + Hash + Clone,
    S: Expiring,
{
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&S> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut S> {
        self.sessions.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.sessions.contains_key(key)
    }

    /// Insert a session and queue its deadline
    pub fn insert(&mut self, key: K, session: S) {
        let expires_at = session.expires_at();
        self.sessions.insert(key.clone(), session);
        self.schedule(key, expires_at);
    }

    /// Queue a deadline for a key; earlier entries for the key become stale
    pub fn schedule(&mut self, key: K, expires_at: Instant) {
        self.heap.push(Reverse(ExpirationEntry { expires_at, key }));
    }

    /// Remove a session outright; its heap entries go stale
    pub fn remove(&mut self, key: &K) -> Option<S> {
        self.sessions.remove(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Heap entries currently queued, stale ones included
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// Earliest queued deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.expires_at)
    }

    /// Pop every entry due at `now` and remove the sessions they still own
    pub fn harvest(&mut self, now: Instant) -> (Vec<(K, S)>, HarvestStats) {
        let mut expired = Vec::new();
        let mut stats = HarvestStats::default();

        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.expires_at <= now)
        {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            stats.popped += 1;

            match self.sessions.entry(entry.key) {
                Entry::Occupied(occupied) if occupied.get().expires_at() == entry.expires_at => {
                    expired.push(occupied.remove_entry());
                }
                _ => stats.stale += 1,
            }
        }

        stats.expired = expired.len();
        (expired, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Dummy {
        expires_at: Instant,
    }

    impl Expiring for Dummy {
        fn expires_at(&self) -> Instant {
            self.expires_at
        }
    }

    #[test]
    fn test_harvest_in_deadline_order() {
        let t0 = Instant::now();
        let mut store = SessionStore::new();
        store.insert("late", Dummy { expires_at: t0 + Duration::from_secs(20) });
        store.insert("early", Dummy { expires_at: t0 + Duration::from_secs(10) });

        let (expired, _) = store.harvest(t0 + Duration::from_secs(15));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "early");
        assert_eq!(store.len(), 1);

        let (expired, _) = store.harvest(t0 + Duration::from_secs(20));
        assert_eq!(expired[0].0, "late");
        assert!(store.is_empty());
    }

    #[test]
    fn test_refresh_leaves_stale_entry() {
        let t0 = Instant::now();
        let mut store = SessionStore::new();
        store.insert("k", Dummy { expires_at: t0 + Duration::from_secs(10) });

        let refreshed = t0 + Duration::from_secs(30);
        store.get_mut(&"k").unwrap().expires_at = refreshed;
        store.schedule("k", refreshed);
        assert_eq!(store.pending(), 2);

        let (expired, stats) = store.harvest(t0 + Duration::from_secs(10));
        assert!(expired.is_empty());
        assert_eq!(stats.stale, 1);
        assert!(store.contains(&"k"));

        let (expired, stats) = store.harvest(refreshed);
        assert_eq!(expired.len(), 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_removed_session_entry_is_discarded() {
        let t0 = Instant::now();
        let mut store = SessionStore::new();
        store.insert(1u32, Dummy { expires_at: t0 });
        assert!(store.remove(&1).is_some());

        let (expired, stats) = store.harvest(t0);
        assert!(expired.is_empty());
        assert_eq!(stats.popped, 1);
        assert_eq!(stats.stale, 1);
    }

    #[test]
    fn test_nothing_due() {
        let t0 = Instant::now();
        let mut store = SessionStore::new();
        store.insert(1u32, Dummy { expires_at: t0 + Duration::from_secs(5) });

        let (expired, stats) = store.harvest(t0);
        assert!(expired.is_empty());
        assert_eq!(stats, HarvestStats::default());
        assert_eq!(store.next_deadline(), Some(t0 + Duration::from_secs(5)));
    }
}
