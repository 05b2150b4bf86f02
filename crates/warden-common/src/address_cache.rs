use std::time::{Duration, Instant};

use lru::LruCache;
use std::num::NonZeroUsize;
use warden_types::{BrokerId, WorkerId};

struct Entry {
    broker_id: BrokerId,
    inserted_at: Instant,
}

/// The broker's worker→broker-address routing cache (`brokerCache.{max,
/// maxAge}`). A hit that has outlived `max_age` is treated as a miss and
/// evicted, so a stale address is never handed back to a caller.
pub struct AddressCache {
    entries: LruCache<WorkerId, Entry>,
    max_age: Duration,
}

impl AddressCache {
    pub fn new(max: usize, max_age: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max.max(1)).unwrap()),
            max_age,
        }
    }

    pub fn get(&mut self, worker_id: &WorkerId) -> Option<BrokerId> {
        let expired = match self.entries.peek(worker_id) {
            Some(entry) => entry.inserted_at.elapsed() > self.max_age,
            None => return None,
        };
        if expired {
            self.entries.pop(worker_id);
            return None;
        }
        self.entries.get(worker_id).map(|e| e.broker_id.clone())
    }

    pub fn insert(&mut self, worker_id: WorkerId, broker_id: BrokerId) {
        self.entries.put(
            worker_id,
            Entry {
                broker_id,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Called on a cache miss that turned out wrong at the remote end (the
    /// owning broker rejected or was unreachable), so the next lookup
    /// falls through to `findBroker` instead of repeating the stale hit.
    pub fn evict(&mut self, worker_id: &WorkerId) {
        self.entries.pop(worker_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn hit_then_miss_after_eviction() {
        let mut cache = AddressCache::new(10, Duration::from_secs(60));
        let w = WorkerId::new("MyWorker#1");
        let b = BrokerId::new("br01");
        cache.insert(w.clone(), b.clone());
        assert_eq!(cache.get(&w), Some(b));
        cache.evict(&w);
        assert_eq!(cache.get(&w), None);
    }

    #[test]
    fn entries_expire_after_max_age() {
        let mut cache = AddressCache::new(10, Duration::from_millis(10));
        let w = WorkerId::new("MyWorker#1");
        cache.insert(w.clone(), BrokerId::new("br01"));
        sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&w), None);
    }

    #[test]
    fn respects_max_capacity() {
        let mut cache = AddressCache::new(2, Duration::from_secs(60));
        cache.insert(WorkerId::new("a"), BrokerId::new("br01"));
        cache.insert(WorkerId::new("b"), BrokerId::new("br01"));
        cache.insert(WorkerId::new("c"), BrokerId::new("br01"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&WorkerId::new("a")), None);
    }
}
