//! Bounded in-process caches for enrichment lookups.
//!
//! All caches are shared by the enrichment workers.  Writes are single-entry
//! updates with last-writer-wins semantics; reads clone the entry out so no
//! lock is held across a suspension point.  An entry older than its TTL is
//! treated as a miss and left in place for the next writer to overwrite.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

struct TtlEntry<V> {
    value: V,
    inserted: Instant,
}

/// A time-bounded cache.  `get` returns the value together with its age.
pub struct TtlCache<K, V> {
    inner: RwLock<HashMap<K, TtlEntry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a fresh entry.  Expired entries read as a miss.
    pub fn get(&self, key: &K) -> Option<(V, Duration)> {
        let guard = self.inner.read().unwrap();
        let entry = guard.get(key)?;
        let age = entry.inserted.elapsed();
        if age < self.ttl {
            Some((entry.value.clone(), age))
        } else {
            None
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.write().unwrap();
        guard.insert(
            key,
            TtlEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// MemoCache
// ---------------------------------------------------------------------------

/// A capped memo cache without expiry.
///
/// At capacity an arbitrary entry is evicted to make room; the workload
/// (handle and community lookups) has no recency structure worth tracking.
pub struct MemoCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
    cap: usize,
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(cap: usize) -> Self {
        MemoCache {
            inner: RwLock::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .read()
            .unwrap()
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.write().unwrap();
        if guard.len() >= self.cap && !guard.contains_key(&key) {
            if let Some(evict) = guard.keys().next().cloned() {
                guard.remove(&evict);
            }
        }
        guard.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// UnitPriceCache
// ---------------------------------------------------------------------------

/// Single-value cache for the unit-currency price.
///
/// Holds the last known price even past the TTL so a failed refresh can fall
/// back to it instead of zeroing every market-cap computation.
pub struct UnitPriceCache {
    inner: RwLock<(f64, Option<Instant>)>,
    ttl: Duration,
}

impl UnitPriceCache {
    pub fn new(initial: f64, ttl: Duration) -> Self {
        UnitPriceCache {
            inner: RwLock::new((initial, None)),
            ttl,
        }
    }

    /// The cached price, only while fresh.
    pub fn get_fresh(&self) -> Option<f64> {
        let guard = self.inner.read().unwrap();
        match guard.1 {
            Some(at) if at.elapsed() < self.ttl => Some(guard.0),
            _ => None,
        }
    }

    pub fn store(&self, price: f64) {
        let mut guard = self.inner.write().unwrap();
        *guard = (price, Some(Instant::now()));
    }

    /// The last known price regardless of age.
    pub fn last_known(&self) -> f64 {
        self.inner
            .read()
            .unwrap()
            .0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_cache_hit_reports_age_and_expires() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(40));
        cache.insert("dev".to_owned(), 7);

        let (value, age) = cache.get(&"dev".to_owned()).expect("fresh entry");
        assert_eq!(value, 7);
        assert!(age < Duration::from_millis(40));

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get(&"dev".to_owned()).is_none(), "expired reads as miss");
        assert_eq!(cache.len(), 1, "stale entry stays until overwritten");
    }

    #[test]
    fn ttl_cache_overwrite_is_last_writer_wins() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("dev".to_owned(), 1);
        cache.insert("dev".to_owned(), 2);
        assert_eq!(cache.get(&"dev".to_owned()).map(|(v, _)| v), Some(2));
    }

    #[test]
    fn memo_cache_caps_entries() {
        let cache: MemoCache<u32, u32> = MemoCache::new(2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&3), Some(3), "newest entry survives eviction");
    }

    #[test]
    fn memo_cache_overwrite_does_not_evict() {
        let cache: MemoCache<u32, u32> = MemoCache::new(2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(2, 20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn unit_price_falls_back_to_last_known() {
        let cache = UnitPriceCache::new(150.0, Duration::from_millis(30));
        assert!(cache.get_fresh().is_none(), "initial value is not fresh");
        assert_eq!(cache.last_known(), 150.0);

        cache.store(161.5);
        assert_eq!(cache.get_fresh(), Some(161.5));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get_fresh().is_none());
        assert_eq!(cache.last_known(), 161.5);
    }
}
