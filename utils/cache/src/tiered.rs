//! Read-through, write-through coordination of the three tiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::external::ExternalCache;
use crate::key::CacheKey;
use crate::memory::UsefulnessCache;
use crate::persistent::PersistentCache;

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,

    /// Tier failures that were treated as misses.
    pub errors: u64,

    pub l1_entries: usize,
    pub l1_evictions: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Multi-tier cache for one kind of value.
///
/// Reads check L1, then L2, then L3; a hit in a slower tier is written back
/// to every faster tier before returning. Writes go to all enabled tiers.
/// Writers and write-backs for the same key are serialized through a
/// per-key lock; different keys never contend.
pub struct TieredCache<V> {
    namespace: String,
    l1: Option<UsefulnessCache<V>>,
    l2: Option<(Arc<dyn ExternalCache>, Duration)>,
    l3: Option<PersistentCache>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    counters: Counters,
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build the enabled tiers. L3 entries live under `<dir>/<namespace>`.
    pub async fn from_config(
        namespace: impl Into<String>,
        config: &CacheConfig,
        external: Option<Arc<dyn ExternalCache>>,
    ) -> Result<Self> {
        config.validate()?;
        let namespace = namespace.into();

        let l1 = config
            .l1
            .enabled
            .then(|| UsefulnessCache::new(config.l1.capacity, config.l1.ttl()));

        let l2 = if config.l2.enabled {
            let external = external.ok_or_else(|| {
                CacheError::InvalidConfiguration(
                    "l2 is enabled but no external cache was supplied".to_string(),
                )
            })?;
            Some((external, config.l2.ttl()))
        } else {
            None
        };

        let l3 = match (&config.l3.dir, config.l3.enabled) {
            (Some(dir), true) => {
                Some(PersistentCache::open(dir.join(&namespace), config.l3.ttl()).await?)
            }
            _ => None,
        };

        info!(
            "Cache {namespace} ready (l1: {}, l2: {}, l3: {})",
            l1.is_some(),
            l2.is_some(),
            l3.is_some()
        );

        Ok(Self {
            namespace,
            l1,
            l2,
            l3,
            key_locks: DashMap::new(),
            counters: Counters::default(),
        })
    }

    /// A cache with every tier off; every lookup misses.
    pub fn disabled(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            l1: None,
            l2: None,
            l3: None,
            key_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether any tier is enabled.
    pub fn is_enabled(&self) -> bool {
        self.l1.is_some() || self.l2.is_some() || self.l3.is_some()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_with_tier(key).await.map(|(value, _)| value)
    }

    /// Look up `key`, reporting which tier served the hit.
    ///
    /// A failing L2 or L3 tier is logged and treated as a miss for that
    /// tier; it is counted in [`CacheStats::errors`].
    pub async fn get_with_tier(&self, key: &CacheKey) -> Option<(V, CacheTier)> {
        if let Some(l1) = &self.l1
            && let Some(value) = l1.get(key.as_str())
        {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some((value, CacheTier::L1));
        }

        if let Some((l2, _)) = &self.l2 {
            match l2.get(key.as_str()).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<V>(&bytes) {
                    Ok(value) => {
                        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                        self.write_back(key, &value, CacheTier::L2).await;
                        return Some((value, CacheTier::L2));
                    }
                    Err(e) => self.record_error(CacheTier::L2, &e.into()),
                },
                Ok(None) => {}
                Err(e) => self.record_error(CacheTier::L2, &e),
            }
        }

        if let Some(l3) = &self.l3 {
            match l3.get::<V>(key.as_str()).await {
                Ok(Some(value)) => {
                    self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
                    self.write_back(key, &value, CacheTier::L3).await;
                    return Some((value, CacheTier::L3));
                }
                Ok(None) => {}
                Err(e) => self.record_error(CacheTier::L3, &e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write `value` through to every enabled tier.
    pub async fn set(&self, key: &CacheKey, value: V) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        let size = bytes.len();
        let _guard = self.lock_key(key).await;

        let l2 = async {
            match &self.l2 {
                Some((external, ttl)) => external.set(key.as_str(), bytes, *ttl).await,
                None => Ok(()),
            }
        };
        let l3 = async {
            match &self.l3 {
                Some(persistent) => persistent.set(key.as_str(), &value).await,
                None => Ok(()),
            }
        };
        let (l2_result, l3_result) = tokio::join!(l2, l3);

        if let Some(l1) = &self.l1 {
            l1.insert(key.as_str(), value, size);
        }

        l2_result?;
        l3_result?;
        Ok(())
    }

    /// Remove `key` from every tier.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.lock_key(key).await;
        if let Some(l1) = &self.l1 {
            l1.remove(key.as_str());
        }
        if let Some((external, _)) = &self.l2 {
            external.delete(key.as_str()).await?;
        }
        if let Some(persistent) = &self.l3 {
            persistent.delete(key.as_str()).await?;
        }
        Ok(())
    }

    /// Drop everything held in L1 and L3. L2 entries age out through their TTL.
    pub async fn clear(&self) -> Result<()> {
        if let Some(l1) = &self.l1 {
            l1.clear();
        }
        if let Some(persistent) = &self.l3 {
            persistent.clear().await?;
        }
        Ok(())
    }

    /// Remove expired entries from every tier, returning the total removed.
    pub async fn sweep(&self) -> usize {
        let mut removed = self.l1.as_ref().map_or(0, UsefulnessCache::sweep);
        if let Some((external, _)) = &self.l2 {
            match external.sweep().await {
                Ok(n) => removed += n,
                Err(e) => self.record_error(CacheTier::L2, &e),
            }
        }
        if let Some(persistent) = &self.l3 {
            match persistent.sweep().await {
                Ok(n) => removed += n,
                Err(e) => self.record_error(CacheTier::L3, &e),
            }
        }
        removed
    }

    /// Sweep on a fixed interval until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep().await;
                        if removed > 0 {
                            debug!("Swept {removed} expired entries from cache {}", cache.namespace);
                        }
                    }
                }
            }
            debug!("Sweeper for cache {} stopped", cache.namespace);
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.counters.l3_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            l1_entries: self.l1.as_ref().map_or(0, UsefulnessCache::len),
            l1_evictions: self.l1.as_ref().map_or(0, UsefulnessCache::evictions),
        }
    }

    async fn write_back(&self, key: &CacheKey, value: &V, found_in: CacheTier) {
        let _guard = self.lock_key(key).await;
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_error(found_in, &e.into());
                return;
            }
        };

        if found_in == CacheTier::L3
            && let Some((external, ttl)) = &self.l2
            && let Err(e) = external.set(key.as_str(), bytes.clone(), *ttl).await
        {
            self.record_error(CacheTier::L2, &e);
        }
        if let Some(l1) = &self.l1 {
            l1.insert(key.as_str(), value.clone(), bytes.len());
        }
    }

    async fn lock_key(&self, key: &CacheKey) -> KeyGuard<'_> {
        let lock = Arc::clone(
            self.key_locks
                .entry(key.as_str().to_string())
                .or_default()
                .value(),
        );
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: &self.key_locks,
            key: key.as_str().to_string(),
            guard: Some(guard),
        }
    }

    fn record_error(&self, tier: CacheTier, error: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!("Cache {} tier {tier:?} failed: {error}", self.namespace);
    }
}

/// Holds the per-key section and prunes the lock entry once unused.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
