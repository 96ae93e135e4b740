//! Configuration for the retrieval engine.
//!
//! [`EngineConfig`] is built once by the caller and handed to the engine
//! builder; each component receives its own section.

use std::sync::Arc;
use std::time::Duration;

use mnemo_embeddings::{EmbeddingProvider, HashingProvider, OllamaProvider, OpenAIProvider};
use mnemo_knowledge::{ChunkStrategy, ChunkerConfig};
use mnemo_utils_cache::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// Configuration for the retrieval engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding provider and adapter settings.
    pub embedding: EmbeddingConfig,

    /// How documents are split.
    pub chunking: ChunkingConfig,

    /// Vector index backend and search defaults.
    pub index: IndexConfig,

    /// Personal memory search defaults.
    pub memory: MemoryConfig,

    /// Context assembly defaults.
    pub context: ContextConfig,

    /// Cache tiers for embeddings and search results.
    pub cache: CacheConfig,

    /// Batch ingestion.
    pub ingest: IngestConfig,
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = embedding;
        self
    }

    /// Set the chunking configuration.
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Set the index configuration.
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Set the context assembly configuration.
    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        self.embedding.validate()?;
        self.chunking.chunker_config().validate()?;
        self.index.validate()?;
        self.memory.validate()?;
        self.context.validate()?;
        self.cache.validate()?;
        if self.ingest.workers == 0 {
            return Err(invalid("ingest.workers must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> RetrievalError {
    RetrievalError::InvalidConfiguration(message.into())
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 1], got {value}")))
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// Deterministic offline feature hashing.
    #[default]
    Hashing,
    /// OpenAI embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Local Ollama server.
    Ollama,
}

/// Configuration for the embedding provider and adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderType,

    /// Model name. `None` uses the provider's default.
    pub model: Option<String>,

    /// Provider endpoint. `None` uses the provider's default.
    pub base_url: Option<String>,

    /// Required for OpenAI.
    pub api_key: Option<String>,

    /// Vector dimension. `None` uses the provider's native size
    /// (1536 OpenAI, 768 Ollama, 256 hashing).
    pub dimensions: Option<usize>,

    /// Largest batch sent in one provider request.
    pub max_batch_size: usize,

    /// Provider requests per second. `None` disables throttling.
    pub requests_per_second: Option<f64>,

    /// Requests allowed back to back.
    pub burst: u32,

    /// How long a caller blocks for request capacity before `Timeout`.
    pub acquire_timeout_secs: u64,

    /// HTTP request timeout.
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Hashing,
            model: None,
            base_url: None,
            api_key: None,
            dimensions: None,
            max_batch_size: 100,
            requests_per_second: Some(10.0),
            burst: 10,
            acquire_timeout_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// OpenAI with the given key.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            provider: EmbeddingProviderType::OpenAI,
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Ollama at its default address.
    pub fn ollama() -> Self {
        Self {
            provider: EmbeddingProviderType::Ollama,
            ..Self::default()
        }
    }

    /// Offline hashing provider with the given dimension.
    pub fn hashing(dimensions: usize) -> Self {
        Self {
            provider: EmbeddingProviderType::Hashing,
            dimensions: Some(dimensions),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set or clear the request rate limit.
    pub fn with_rate_limit(mut self, requests_per_second: Option<f64>, burst: u32) -> Self {
        self.requests_per_second = requests_per_second;
        self.burst = burst;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(invalid("embedding.max_batch_size must be greater than zero"));
        }
        if self.dimensions == Some(0) {
            return Err(invalid("embedding.dimensions must be greater than zero"));
        }
        if let Some(rate) = self.requests_per_second
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(invalid(format!(
                "embedding.requests_per_second must be positive, got {rate}"
            )));
        }
        if self.requests_per_second.is_some() && self.burst == 0 {
            return Err(invalid("embedding.burst must be greater than zero"));
        }
        if self.provider == EmbeddingProviderType::OpenAI && self.api_key.is_none() {
            return Err(invalid("embedding.api_key is required for openai"));
        }
        Ok(())
    }

    /// Construct the configured provider.
    pub fn build_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let timeout = self.request_timeout();
        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            EmbeddingProviderType::Hashing => {
                Arc::new(HashingProvider::new(self.dimensions.unwrap_or(256)))
            }
            EmbeddingProviderType::OpenAI => {
                let mut provider = OpenAIProvider::new().with_timeout(timeout)?;
                if let Some(key) = &self.api_key {
                    provider = provider.with_api_key(key);
                }
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url);
                }
                if let Some(model) = &self.model {
                    provider = provider.with_model(model);
                }
                if let Some(dimensions) = self.dimensions {
                    provider = provider.with_dimensions(dimensions);
                }
                Arc::new(provider)
            }
            EmbeddingProviderType::Ollama => {
                let mut provider = OllamaProvider::new().with_timeout(timeout)?;
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url);
                }
                if let Some(model) = &self.model {
                    provider = provider.with_model(model);
                }
                if let Some(dimensions) = self.dimensions {
                    provider = provider.with_dimension(dimensions);
                }
                Arc::new(provider)
            }
        };
        Ok(provider)
    }
}

/// Configuration for document chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,

    /// `fixed-width` or `paragraph-aware`. Anything else means fixed-width.
    pub strategy: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            min_chunk_size: 0,
            strategy: "fixed-width".to_string(),
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig::new(self.chunk_size, self.overlap)
            .with_min_chunk_size(self.min_chunk_size)
            .with_strategy(ChunkStrategy::from_name(&self.strategy))
    }
}

/// Which vector index backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Configuration for the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,

    /// Connection string for backends that need one.
    pub url: Option<String>,

    /// Default minimum relevance for knowledge search.
    pub score_threshold: f32,

    /// Default result limit for knowledge search.
    pub max_results: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Memory,
            url: None,
            score_threshold: 0.7,
            max_results: 20,
        }
    }
}

impl IndexConfig {
    /// SQLite at `url`.
    pub fn sqlite(url: impl Into<String>) -> Self {
        Self {
            backend: IndexBackend::Sqlite,
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_score_threshold(mut self, score_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_unit_interval("index.score_threshold", self.score_threshold)?;
        if self.backend == IndexBackend::Sqlite && self.url.is_none() {
            return Err(invalid("index.url is required for sqlite"));
        }
        Ok(())
    }
}

/// Configuration for personal memory search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_results: usize,
    pub score_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_results: 10,
            score_threshold: 0.1,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        check_unit_interval("memory.score_threshold", self.score_threshold)
    }
}

/// Defaults for context assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub personal_weight: f32,
    pub knowledge_weight: f32,
    pub history_limit: usize,
    pub include_sources: bool,

    /// Reject results more similar than this to an already selected one.
    pub diversity_threshold: Option<f32>,

    /// Minimum knowledge relevance when gathering context candidates. Low
    /// by default so the token budget does the selecting.
    pub score_threshold: f32,

    /// Candidates fetched per source are `max_tokens / tokens_per_result`.
    pub tokens_per_result: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            personal_weight: 0.3,
            knowledge_weight: 0.7,
            history_limit: 5,
            include_sources: true,
            diversity_threshold: None,
            score_threshold: 0.0,
            tokens_per_result: 100,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        validate_weights(self.personal_weight, self.knowledge_weight)?;
        if let Some(threshold) = self.diversity_threshold {
            check_unit_interval("context.diversity_threshold", threshold)?;
        }
        check_unit_interval("context.score_threshold", self.score_threshold)?;
        if self.tokens_per_result == 0 {
            return Err(invalid("context.tokens_per_result must be greater than zero"));
        }
        Ok(())
    }
}

/// Weights must be finite, non-negative and not both zero.
pub(crate) fn validate_weights(personal: f32, knowledge: f32) -> Result<()> {
    for (name, weight) in [("personal_weight", personal), ("knowledge_weight", knowledge)] {
        if !weight.is_finite() || weight < 0.0 {
            return Err(invalid(format!("{name} must be a non-negative number, got {weight}")));
        }
    }
    if personal + knowledge <= 0.0 {
        return Err(invalid("personal_weight and knowledge_weight cannot both be zero"));
    }
    Ok(())
}

/// Configuration for batch ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Documents processed in parallel.
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.index.score_threshold, 0.7);
        assert_eq!(config.context.max_tokens, 4000);
        assert_eq!(config.context.score_threshold, 0.0);
        assert_eq!(config.context.tokens_per_result, 100);
        assert_eq!(config.ingest.workers, 4);
    }

    #[test]
    fn test_parse_toml_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [embedding]
            provider = "ollama"
            model = "all-minilm"
            requests_per_second = 2.5
            burst = 3

            [chunking]
            chunk_size = 500
            overlap = 50
            strategy = "paragraph-aware"

            [index]
            backend = "sqlite"
            url = "sqlite::memory:"

            [context]
            max_tokens = 800
            diversity_threshold = 0.9

            [cache.l1]
            capacity = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.embedding.provider, EmbeddingProviderType::Ollama);
        assert_eq!(config.embedding.requests_per_second, Some(2.5));
        assert_eq!(
            config.chunking.chunker_config().strategy,
            ChunkStrategy::ParagraphAware
        );
        assert_eq!(config.index.backend, IndexBackend::Sqlite);
        assert_eq!(config.context.diversity_threshold, Some(0.9));
        assert_eq!(config.context.personal_weight, 0.3);
        assert_eq!(config.cache.l1.capacity, 50);
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_fixed_width() {
        let chunking = ChunkingConfig::new(100, 10).with_strategy("semantic");
        assert_eq!(chunking.chunker_config().strategy, ChunkStrategy::FixedWidth);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_overlap = EngineConfig::default().with_chunking(ChunkingConfig::new(100, 100));
        assert!(matches!(
            bad_overlap.validate(),
            Err(RetrievalError::InvalidConfiguration(_))
        ));

        let zero_weights = EngineConfig::default().with_context(ContextConfig {
            personal_weight: 0.0,
            knowledge_weight: 0.0,
            ..ContextConfig::default()
        });
        assert!(zero_weights.validate().is_err());

        let openai_without_key = EngineConfig::default().with_embedding(EmbeddingConfig {
            provider: EmbeddingProviderType::OpenAI,
            ..EmbeddingConfig::default()
        });
        assert!(openai_without_key.validate().is_err());

        let sqlite_without_url = EngineConfig::default().with_index(IndexConfig {
            backend: IndexBackend::Sqlite,
            ..IndexConfig::default()
        });
        assert!(sqlite_without_url.validate().is_err());

        assert!(EngineConfig::from_toml_str("[ingest]\nworkers = 0").is_err());
        assert!(EngineConfig::from_toml_str("[index]\nscore_threshold = \"high\"").is_err());
    }

    #[test]
    fn test_provider_dimensions() {
        let hashing = EmbeddingConfig::default().build_provider().unwrap();
        assert_eq!(hashing.dimension(), 256);

        let ollama = EmbeddingConfig::ollama().build_provider().unwrap();
        assert_eq!(ollama.dimension(), 768);

        let openai = EmbeddingConfig::openai("sk-test").build_provider().unwrap();
        assert_eq!(openai.dimension(), 1536);
    }
}
