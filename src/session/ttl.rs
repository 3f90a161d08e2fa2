/// Concurrent map whose entries expire a fixed time after they were written
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Write-order records kept beyond this many are compacted on the next insert
const MIN_ORDER_SLACK: usize = 16;

struct Entry<V> {
    value: V,
    written_at: Instant,
    /// Write sequence number, matches the entry's record in the write order
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.written_at) >= ttl
    }
}

/// Bounded TTL map.
///
/// Expired entries are dropped lazily by `get` and in bulk by `sweep`; the
/// two never depend on each other. A write that pushes the map over capacity
/// evicts the least recently written entries instead of being refused. Reads
/// and writes are concurrent but not linearizable across keys.
pub struct TtlMap<K, V> {
    entries: DashMap<K, Entry<V>>,
    /// `(key, seq)` per write, oldest first. Records whose seq no longer
    /// matches the stored entry are stale and skipped.
    ///
    /// Lock order: `order` before any `entries` shard.
    order: Mutex<VecDeque<(K, u64)>>,
    next_seq: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            ttl,
            capacity,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now, self.ttl) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        // The read guard is gone here; removing under it would deadlock the shard.
        let ttl = self.ttl;
        self.entries.remove_if(key, |_, entry| entry.is_expired(now, ttl));
        None
    }

    /// Insert or overwrite, restarting the entry's expiry.
    ///
    /// When the map grows past capacity the least recently written entries
    /// are evicted, expired or not. Returns the previous value of `key`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(
            key.clone(),
            Entry {
                value,
                written_at: Instant::now(),
                seq,
            },
        );

        let mut order = self.order.lock();
        order.push_back((key, seq));
        while self.entries.len() > self.capacity {
            let Some((oldest, oldest_seq)) = order.pop_front() else {
                break;
            };
            self.entries.remove_if(&oldest, |_, entry| entry.seq == oldest_seq);
        }
        if order.len() > self.capacity.saturating_mul(2).max(MIN_ORDER_SLACK) {
            self.compact(&mut order);
        }

        previous.map(|entry| entry.value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now, ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.compact(&mut self.order.lock());
        removed
    }

    /// Keep only entries whose value satisfies `keep`; returns how many were dropped
    pub fn retain_values<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let kept = keep(&entry.value);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop write-order records of overwritten or removed entries
    fn compact(&self, order: &mut VecDeque<(K, u64)>) {
        order.retain(|(key, seq)| {
            self.entries
                .get(key)
                .is_some_and(|entry| entry.seq == *seq)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_expires_lazily() {
        let map = TtlMap::new(Duration::from_secs(10), 16);
        map.insert("a", 1);
        assert_eq!(map.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a"), None);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_restarts_expiry() {
        let map = TtlMap::new(Duration::from_secs(10), 16);
        map.insert("a", 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        map.insert("a", 2);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(map.get(&"a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_is_independent_of_get() {
        let map = TtlMap::new(Duration::from_secs(5), 16);
        map.insert(1, "old");
        map.insert(2, "old");
        tokio::time::advance(Duration::from_secs(3)).await;
        map.insert(3, "new");
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(map.sweep(), 2);
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.get(&3), Some("new"));
    }

    #[test]
    fn test_full_map_evicts_least_recently_written() {
        let map = TtlMap::new(Duration::from_secs(60), 2);
        assert_eq!(map.insert(1, "a"), None);
        map.insert(2, "b");
        map.insert(3, "c");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&2), Some("b"));
        assert_eq!(map.get(&3), Some("c"));

        // An overwrite moves the key to the back of the write order
        assert_eq!(map.insert(2, "b2"), Some("b"));
        map.insert(4, "d");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&3), None);
        assert_eq!(map.get(&2), Some("b2"));
        assert_eq!(map.get(&4), Some("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_leaves_expired_entries_to_sweep() {
        let map = TtlMap::new(Duration::from_secs(5), 4);
        map.insert(1, ());
        map.insert(2, ());
        tokio::time::advance(Duration::from_secs(5)).await;

        map.insert(3, ());
        assert_eq!(map.len(), 3);
        assert_eq!(map.sweep(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_write_order_stays_bounded() {
        let map = TtlMap::new(Duration::from_secs(60), 4);
        for i in 0..1000 {
            map.insert(i % 3, i);
        }
        assert_eq!(map.len(), 3);
        assert!(map.order.lock().len() <= MIN_ORDER_SLACK);

        map.remove(&0);
        map.sweep();
        assert_eq!(map.order.lock().len(), 2);
    }

    #[test]
    fn test_retain_values() {
        let map = TtlMap::new(Duration::from_secs(60), 16);
        for key in 0..6 {
            map.insert(key, key % 2);
        }
        assert_eq!(map.retain_values(|value| *value == 0), 3);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&2), Some(0));
        assert_eq!(map.get(&3), None);
    }
}
