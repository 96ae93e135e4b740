//! L1: bounded in-process tier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Bounded in-process cache with TTL expiry and usefulness-based eviction.
///
/// When the capacity is exceeded the entry with the lowest
/// `frequency / (1 + hours_since_last_access)` is evicted. Expired entries
/// always go first. Entries live in a sharded map, so readers never block
/// each other and a write only locks the shard holding its key.
pub struct UsefulnessCache<V> {
    entries: DashMap<String, Slot<V>>,
    capacity: usize,
    ttl: Duration,
    epoch: Instant,
    evictions: AtomicU64,
}

struct Slot<V> {
    value: V,
    created_at: Instant,
    size_bytes: usize,
    access_count: AtomicU64,
    /// Milliseconds since the cache epoch.
    last_access_ms: AtomicU64,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Point-in-time view of an L1 entry's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub access_count: u64,
    pub size_bytes: usize,
    pub age: Duration,
    pub idle: Duration,
}

impl<V: Clone> UsefulnessCache<V> {
    /// Create an empty cache.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            epoch: Instant::now(),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live entry, recording the access.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let slot = self.entries.get(key)?;
            if !slot.is_expired(now, self.ttl) {
                slot.access_count.fetch_add(1, Ordering::Relaxed);
                slot.last_access_ms
                    .store(self.millis_since_epoch(now), Ordering::Relaxed);
                return Some(slot.value.clone());
            }
        }
        self.entries
            .remove_if(key, |_, slot| slot.is_expired(now, self.ttl));
        None
    }

    /// Insert or replace an entry, evicting the least useful entries while
    /// over capacity. The entry just written is never the victim.
    pub fn insert(&self, key: impl Into<String>, value: V, size_bytes: usize) {
        let key = key.into();
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            Slot {
                value,
                created_at: now,
                size_bytes,
                access_count: AtomicU64::new(1),
                last_access_ms: AtomicU64::new(self.millis_since_epoch(now)),
            },
        );

        while self.entries.len() > self.capacity {
            let Some(victim) = self.least_useful(now, &key) else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted L1 entry {victim}");
            }
        }
    }

    /// Bookkeeping for a live entry.
    pub fn info(&self, key: &str) -> Option<EntryInfo> {
        let now = Instant::now();
        let slot = self.entries.get(key)?;
        let last_access = self.epoch + Duration::from_millis(slot.last_access_ms.load(Ordering::Relaxed));
        Some(EntryInfo {
            access_count: slot.access_count.load(Ordering::Relaxed),
            size_bytes: slot.size_bytes,
            age: now.saturating_duration_since(slot.created_at),
            idle: now.saturating_duration_since(last_access),
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now, self.ttl));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted for capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn least_useful(&self, now: Instant, keep: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|entry| entry.key() != keep)
            .map(|entry| {
                let slot = entry.value();
                let last_access_ms = slot.last_access_ms.load(Ordering::Relaxed);
                let score = if slot.is_expired(now, self.ttl) {
                    f64::NEG_INFINITY
                } else {
                    let idle_ms = self.millis_since_epoch(now).saturating_sub(last_access_ms);
                    let hours = idle_ms as f64 / 3_600_000.0;
                    slot.access_count.load(Ordering::Relaxed) as f64 / (1.0 + hours)
                };
                (score, last_access_ms, entry.key().clone())
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(&b.2))
            })
            .map(|(_, _, key)| key)
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_get_after_insert() {
        let cache = UsefulnessCache::new(10, HOUR);
        cache.insert("a", 1, 8);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = UsefulnessCache::new(10, Duration::from_secs(60));
        cache.insert("a", "value".to_string(), 5);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("a"), Some("value".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_frequent() {
        let cache = UsefulnessCache::new(2, HOUR);
        cache.insert("a", 1, 1);
        cache.insert("b", 2, 1);
        cache.get("a");
        cache.get("a");

        cache.insert("c", 3, 1);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recency_decays_usefulness() {
        let cache = UsefulnessCache::new(2, 100 * HOUR);
        cache.insert("old", 1, 1);
        cache.get("old");
        cache.get("old");

        // 3 accesses, idle 10h: 3 / 11 < 1 / 1
        tokio::time::advance(10 * HOUR).await;
        cache.insert("fresh", 2, 1);
        cache.insert("newest", 3, 1);

        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("fresh"), Some(2));
        assert_eq!(cache.get("newest"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_entry_survives_eviction() {
        let cache = UsefulnessCache::new(1, HOUR);
        cache.insert("a", 1, 1);
        for _ in 0..10 {
            cache.get("a");
        }
        cache.insert("b", 2, 1);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_tracks_access() {
        let cache = UsefulnessCache::new(4, HOUR);
        cache.insert("a", 1, 42);
        cache.get("a");
        tokio::time::advance(Duration::from_secs(30)).await;

        let info = cache.info("a").unwrap();
        assert_eq!(info.access_count, 2);
        assert_eq!(info.size_bytes, 42);
        assert_eq!(info.idle, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = UsefulnessCache::new(10, Duration::from_secs(10));
        cache.insert("a", 1, 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.insert("b", 2, 1);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }
}
