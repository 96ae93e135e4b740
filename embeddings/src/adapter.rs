//! Batching, caching front end for an [`EmbeddingProvider`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mnemo_utils_cache::{CacheKey, TieredCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::limiter::TokenBucket;
use crate::provider::EmbeddingProvider;

/// Cache namespace for embedding vectors.
pub const EMBEDDING_NAMESPACE: &str = "embeddings";

/// Settings for [`EmbeddingAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Largest number of texts sent to the provider in one request.
    pub max_batch_size: usize,

    /// Dimension every returned vector must have.
    pub dimension: usize,

    /// Provider requests per second. `None` disables rate limiting.
    pub requests_per_second: Option<f64>,

    /// Requests allowed back to back before throttling starts.
    pub burst: u32,

    /// How long a caller blocks waiting for request capacity.
    pub acquire_timeout: Duration,
}

impl AdapterConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            max_batch_size: 100,
            dimension,
            requests_per_second: None,
            burst: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64, burst: u32) -> Self {
        self.requests_per_second = Some(requests_per_second);
        self.burst = burst;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Counters describing adapter traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterStats {
    pub cache_hits: u64,
    pub provider_requests: u64,
    pub texts_embedded: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    provider_requests: AtomicU64,
    texts_embedded: AtomicU64,
    retries: AtomicU64,
}

/// Turns texts into embeddings.
///
/// Each text is looked up in the cache by a hash of (model, text); only
/// misses reach the provider, deduplicated and split into batches of at most
/// `max_batch_size`. Batches go out one after another, each behind the
/// token bucket. Every batch is validated and cached as soon as it arrives,
/// so a failure in a later batch does not lose earlier ones.
pub struct EmbeddingAdapter {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<TieredCache<Embedding>>,
    limiter: Option<TokenBucket>,
    config: AdapterConfig,
    counters: Counters,
}

impl EmbeddingAdapter {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<TieredCache<Embedding>>,
        config: AdapterConfig,
    ) -> Result<Self> {
        if config.max_batch_size == 0 {
            return Err(EmbeddingError::InvalidConfiguration(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if config.dimension == 0 {
            return Err(EmbeddingError::InvalidConfiguration(
                "dimension must be greater than zero".to_string(),
            ));
        }
        if provider.dimension() != config.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: config.dimension,
                actual: provider.dimension(),
            });
        }

        let limiter = config
            .requests_per_second
            .map(|rate| TokenBucket::new(rate, config.burst))
            .transpose()?;

        Ok(Self {
            provider,
            cache,
            limiter,
            config,
            counters: Counters::default(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn cache(&self) -> &Arc<TieredCache<Embedding>> {
        &self.cache
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let mut embeddings = self.embed(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    /// Embed `texts`, returning vectors in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut results: Vec<Option<Embedding>> = vec![None; texts.len()];
        let keys: Vec<CacheKey> = texts
            .iter()
            .map(|text| CacheKey::for_content(EMBEDDING_NAMESPACE, self.model(), text))
            .collect();

        // Unique misses in first-seen order, plus positions sharing each text.
        let mut pending: Vec<usize> = Vec::new();
        let mut duplicates: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            match self.cache.get(key).await {
                Some(embedding) if embedding.len() == self.config.dimension => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    results[i] = Some(embedding);
                }
                _ => {
                    let positions = duplicates.entry(texts[i].as_str()).or_default();
                    if positions.is_empty() {
                        pending.push(i);
                    }
                    positions.push(i);
                }
            }
        }

        if !pending.is_empty() {
            debug!(
                "Embedding {} of {} texts with {} ({} cached)",
                pending.len(),
                texts.len(),
                self.provider.name(),
                texts.len() - duplicates.values().map(Vec::len).sum::<usize>()
            );
        }

        for (batch_number, batch) in pending.chunks(self.config.max_batch_size).enumerate() {
            if let Some(limiter) = &self.limiter {
                limiter.acquire(self.config.acquire_timeout).await?;
            }

            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = match self.request(&inputs).await {
                Ok(embeddings) => embeddings,
                Err(e) => {
                    if batch_number > 0 {
                        debug!("Batch {batch_number} failed; earlier batches remain cached");
                    }
                    return Err(e);
                }
            };

            if embeddings.len() != inputs.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    inputs.len(),
                    embeddings.len()
                )));
            }
            // Validate the whole batch before anything is written.
            if let Some(bad) = embeddings
                .iter()
                .find(|embedding| embedding.len() != self.config.dimension)
            {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: bad.len(),
                });
            }

            for (&i, embedding) in batch.iter().zip(embeddings) {
                if let Err(e) = self.cache.set(&keys[i], embedding.clone()).await {
                    warn!("Failed to cache embedding: {e}");
                }
                for &position in duplicates.get(texts[i].as_str()).into_iter().flatten() {
                    results[position] = Some(embedding.clone());
                }
            }
            self.counters
                .texts_embedded
                .fetch_add(inputs.len() as u64, Ordering::Relaxed);
        }

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".to_string()))
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            provider_requests: self.counters.provider_requests.load(Ordering::Relaxed),
            texts_embedded: self.counters.texts_embedded.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// One provider call, retried once on a transient 5xx.
    async fn request(&self, inputs: &[String]) -> Result<Vec<Embedding>> {
        self.counters.provider_requests.fetch_add(1, Ordering::Relaxed);
        match self.provider.embed_batch(inputs).await {
            Err(e) if e.is_transient() => {
                warn!("{} failed with {e}, retrying once", self.provider.name());
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                self.counters.provider_requests.fetch_add(1, Ordering::Relaxed);
                match self.provider.embed_batch(inputs).await {
                    Err(e) if e.is_transient() => Err(EmbeddingError::ProviderUnavailable(format!(
                        "{} failed after retry: {e}",
                        self.provider.name()
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_utils_cache::CacheConfig;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider that records batches and replays scripted failures.
    struct ScriptedProvider {
        dimension: usize,
        batches: Mutex<Vec<Vec<String>>>,
        failures: Mutex<VecDeque<Option<EmbeddingError>>>,
        returned_dimension: usize,
    }

    impl ScriptedProvider {
        fn new(dimension: usize) -> Self {
            Self {
                dimension,
                batches: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                returned_dimension: dimension,
            }
        }

        /// Script the outcome of the next calls; `None` means succeed.
        fn script(self, outcomes: Vec<Option<EmbeddingError>>) -> Self {
            *self.failures.lock().unwrap() = outcomes.into();
            self
        }

        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-model"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        async fn embed(&self, text: &str) -> Result<Embedding> {
            Ok(vec![text.len() as f32; self.returned_dimension])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.batches.lock().unwrap().push(texts.to_vec());
            if let Some(Some(error)) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32; self.returned_dimension])
                .collect())
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn server_error() -> EmbeddingError {
        EmbeddingError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        }
    }

    async fn cache() -> Arc<TieredCache<Embedding>> {
        Arc::new(
            TieredCache::from_config("embeddings", &CacheConfig::default(), None)
                .await
                .unwrap(),
        )
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_only_misses_reach_provider() {
        let provider = Arc::new(ScriptedProvider::new(2));
        let adapter =
            EmbeddingAdapter::new(provider.clone(), cache().await, AdapterConfig::new(2)).unwrap();

        adapter.embed(&texts(&["a", "bb"])).await.unwrap();
        let result = adapter.embed(&texts(&["a", "bb", "ccc"])).await.unwrap();

        assert_eq!(result, vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]]);
        assert_eq!(
            provider.batches(),
            vec![texts(&["a", "bb"]), texts(&["ccc"])]
        );
        assert_eq!(adapter.stats().cache_hits, 2);
    }

    #[tokio::test]
    async fn test_batches_are_capped() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let config = AdapterConfig::new(1).with_max_batch_size(2);
        let adapter = EmbeddingAdapter::new(provider.clone(), cache().await, config).unwrap();

        let result = adapter
            .embed(&texts(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        let sizes: Vec<usize> = provider.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_texts_embedded_once() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let adapter =
            EmbeddingAdapter::new(provider.clone(), cache().await, AdapterConfig::new(1)).unwrap();

        let result = adapter.embed(&texts(&["x", "yy", "x"])).await.unwrap();

        assert_eq!(result, vec![vec![1.0], vec![2.0], vec![1.0]]);
        assert_eq!(provider.batches(), vec![texts(&["x", "yy"])]);
    }

    #[tokio::test]
    async fn test_transient_error_retried_once() {
        let provider = Arc::new(ScriptedProvider::new(1).script(vec![Some(server_error())]));
        let adapter =
            EmbeddingAdapter::new(provider.clone(), cache().await, AdapterConfig::new(1)).unwrap();

        let result = adapter.embed(&texts(&["a"])).await.unwrap();

        assert_eq!(result, vec![vec![1.0]]);
        assert_eq!(provider.batches().len(), 2);
        assert_eq!(adapter.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_repeated_server_error_is_unavailable() {
        let provider = Arc::new(
            ScriptedProvider::new(1).script(vec![Some(server_error()), Some(server_error())]),
        );
        let adapter =
            EmbeddingAdapter::new(provider.clone(), cache().await, AdapterConfig::new(1)).unwrap();

        let err = adapter.embed(&texts(&["a"])).await.unwrap_err();

        assert!(matches!(err, EmbeddingError::ProviderUnavailable(_)));
        assert_eq!(provider.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_is_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::new(1)
                .script(vec![Some(EmbeddingError::RateLimited { retry_after_secs: 3 })]),
        );
        let adapter =
            EmbeddingAdapter::new(provider.clone(), cache().await, AdapterConfig::new(1)).unwrap();

        let err = adapter.embed(&texts(&["a"])).await.unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::RateLimited {
                retry_after_secs: 3
            }
        ));
        assert_eq!(provider.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_earlier_batches_survive_later_failure() {
        let provider = Arc::new(ScriptedProvider::new(1).script(vec![
            None,
            Some(EmbeddingError::ProviderUnavailable("down".to_string())),
        ]));
        let config = AdapterConfig::new(1).with_max_batch_size(2);
        let adapter = EmbeddingAdapter::new(provider.clone(), cache().await, config).unwrap();

        let err = adapter
            .embed(&texts(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderUnavailable(_)));

        // The first batch was cached; only "c" is requested again.
        adapter.embed(&texts(&["a", "b", "c"])).await.unwrap();
        assert_eq!(provider.batches().last(), Some(&texts(&["c"])));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        let mut provider = ScriptedProvider::new(4);
        provider.returned_dimension = 3;
        let cache = cache().await;
        let adapter =
            EmbeddingAdapter::new(Arc::new(provider), cache.clone(), AdapterConfig::new(4)).unwrap();

        let err = adapter.embed(&texts(&["a"])).await.unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        let key = CacheKey::for_content(EMBEDDING_NAMESPACE, "scripted-model", "a");
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_provider_dimension_checked_at_construction() {
        let result = EmbeddingAdapter::new(
            Arc::new(ScriptedProvider::new(8)),
            cache().await,
            AdapterConfig::new(16),
        );
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_times_out() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let config = AdapterConfig::new(1)
            .with_max_batch_size(1)
            .with_rate_limit(0.5, 1)
            .with_acquire_timeout(Duration::from_millis(500));
        let adapter = EmbeddingAdapter::new(provider.clone(), cache().await, config).unwrap();

        let err = adapter.embed(&texts(&["a", "b"])).await.unwrap_err();

        assert!(matches!(err, EmbeddingError::Timeout(_)));
        assert_eq!(provider.batches(), vec![texts(&["a"])]);
    }
}
