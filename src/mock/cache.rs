// =============================================================================
// Mock State Cache — bounded LRU with expiry-aware sweeping
// =============================================================================
//
// Holds the latest synthetic quote per instrument. Capacity-bounded: an
// insert beyond capacity evicts the least-recently-used entry, but only
// after expired entries have been swept (expired entries go first, always).
// Writers serialize on one mutex; readers receive `Arc` snapshots so no
// lock is held while a quote is consumed.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::debug;

use crate::mock::generator::MockQuote;

struct Entry {
    quote: Arc<MockQuote>,
    last_used: u64,
}

pub struct MockStateCache {
    max_size: usize,
    entries: Mutex<HashMap<u32, Entry>>,
    clock: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl MockStateCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the quote for an instrument.
    ///
    /// Expired entries are swept inline first; only then, if the cache is
    /// still over capacity, the least-recently-used entry is evicted.
    pub fn insert(&self, token: u32, quote: MockQuote, today: NaiveDate) {
        let mut entries = self.entries.lock();

        Self::sweep_locked(&mut entries, today, &self.expired_removed);

        let stamp = self.tick();
        entries.insert(
            token,
            Entry {
                quote: Arc::new(quote),
                last_used: stamp,
            },
        );

        while entries.len() > self.max_size {
            if let Some((&oldest, _)) = entries.iter().min_by_key(|(_, e)| e.last_used) {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(token = oldest, "mock cache evicted LRU entry");
            } else {
                break;
            }
        }
    }

    /// Fetch a quote, refreshing its recency.
    pub fn get(&self, token: u32) -> Option<Arc<MockQuote>> {
        let mut entries = self.entries.lock();
        let stamp = self.tick();
        entries.get_mut(&token).map(|e| {
            e.last_used = stamp;
            e.quote.clone()
        })
    }

    /// Remove every entry whose option expiry is strictly before `today`.
    /// Called inline before inserts and by the periodic sweeper.
    pub fn sweep(&self, today: NaiveDate) -> usize {
        let mut entries = self.entries.lock();
        Self::sweep_locked(&mut entries, today, &self.expired_removed)
    }

    fn sweep_locked(
        entries: &mut HashMap<u32, Entry>,
        today: NaiveDate,
        counter: &AtomicU64,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, e| !matches!(e.quote.expiry, Some(exp) if exp < today));
        let removed = before - entries.len();
        if removed > 0 {
            counter.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "mock cache swept expired entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MockStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStateCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("evictions", &self.evictions())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quote(token: u32, expiry: Option<NaiveDate>) -> MockQuote {
        MockQuote {
            instrument_token: token,
            last_price: 100.0,
            volume: 1000,
            oi: None,
            expiry,
            timestamp: Utc::now(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = MockStateCache::new(3);
        for token in 0..10 {
            cache.insert(token, quote(token, None), day(25));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evictions(), 7);
    }

    #[test]
    fn lru_evicts_the_least_recently_used() {
        let cache = MockStateCache::new(2);
        cache.insert(1, quote(1, None), day(25));
        cache.insert(2, quote(2, None), day(25));
        // Touch 1 so 2 becomes the LRU.
        assert!(cache.get(1).is_some());
        cache.insert(3, quote(3, None), day(25));

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn expired_entries_removed_before_any_eviction() {
        let cache = MockStateCache::new(2);
        cache.insert(1, quote(1, Some(day(20))), day(20));
        cache.insert(2, quote(2, None), day(20));

        // Day rolls: entry 1 is expired. Inserting 3 sweeps it instead of
        // evicting the live entry 2.
        cache.insert(3, quote(3, None), day(21));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn periodic_sweep_removes_only_expired() {
        let cache = MockStateCache::new(10);
        cache.insert(1, quote(1, Some(day(20))), day(20));
        cache.insert(2, quote(2, Some(day(27))), day(20));
        cache.insert(3, quote(3, None), day(20));

        let removed = cache.sweep(day(25));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 2);
        // Expiring exactly today survives the sweep.
        assert_eq!(cache.sweep(day(27)), 0);
    }

    #[test]
    fn get_returns_shared_snapshots() {
        let cache = MockStateCache::new(2);
        cache.insert(1, quote(1, None), day(25));
        let a = cache.get(1).unwrap();
        let b = cache.get(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
