//! Memory engine implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mnemo_embeddings::{
    AdapterConfig, AdapterStats, EMBEDDING_NAMESPACE, EmbeddingAdapter, EmbeddingProvider,
};
use mnemo_knowledge::{
    Chunker, Document, InMemoryVectorIndex, IndexStats, IndexedChunk, KnowledgeResult,
    MetadataValue, SearchFilter, SearchRequest, SqliteVectorIndex, VectorIndex,
};
use mnemo_utils_cache::{CacheKey, CacheStats, ExternalCache, TieredCache};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{ContextAssembler, RagContext};
use crate::config::{EngineConfig, IndexBackend};
use crate::context::{RequestContext, SessionId};
use crate::error::{IngestFailure, Result, RetrievalError};
use crate::memory::{MemoryEntry, MemoryStats, Message, PersonalMemoryStore, PersonalResult, Role};
use crate::observer::{
    EngineObserver, IngestFinished, IngestStarted, Observers, SearchFinished, SearchKind,
    SearchStarted,
};
use crate::options::{ContextOptions, SearchOptions};
use crate::ranker::{HybridRanker, RankedResult};

/// Cache namespace for knowledge search results.
pub const SEARCH_NAMESPACE: &str = "search";

/// Results of a search across knowledge and personal memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub query: String,
    pub personal: Vec<PersonalResult>,
    pub knowledge: Vec<KnowledgeResult>,

    /// Both lists merged by the hybrid ranker.
    pub ranked: Vec<RankedResult>,

    pub total_results: usize,
    pub search_time: Duration,
}

/// Statistics about the engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub index: IndexStats,
    pub memory: MemoryStats,
    pub adapter: AdapterStats,
    pub embedding_cache: CacheStats,
    pub search_cache: CacheStats,

    /// Number of index changes since the engine started.
    pub index_generation: u64,
}

/// Everything that identifies a knowledge search. Hashed into the cache key.
#[derive(Serialize)]
struct SearchIdentity<'a> {
    instance: &'a str,
    generation: u64,
    model: &'a str,
    query: &'a str,
    limit: usize,
    score_threshold: f32,
    filter: &'a SearchFilter,
}

/// Memory and knowledge retrieval engine.
///
/// This is the entry point for callers. It coordinates:
/// - Document chunking, embedding and atomic per-document commits
/// - Knowledge search with cached results
/// - Session-scoped personal memory and conversation history
/// - Hybrid ranking and token-budgeted context assembly
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    chunker: Chunker,
    adapter: EmbeddingAdapter,
    index: Arc<dyn VectorIndex>,
    memory: PersonalMemoryStore,
    search_cache: Arc<TieredCache<Vec<KnowledgeResult>>>,

    /// Distinguishes this engine's search cache entries from any persisted
    /// by an earlier process.
    instance: String,

    /// Bumped on every index change; part of every search cache key.
    generation: AtomicU64,

    workers: Arc<Semaphore>,
    observers: Observers,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MemoryEngine {
    /// Create a new engine builder.
    pub fn builder(config: EngineConfig) -> MemoryEngineBuilder {
        MemoryEngineBuilder::new(config)
    }

    /// Build an engine with the backends named in `config`.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Embedding dimension of this deployment.
    pub fn dimension(&self) -> usize {
        self.inner.adapter.dimension()
    }

    // ---- Sessions ----

    /// A fresh session id.
    pub fn new_session(&self) -> SessionId {
        SessionId::generate()
    }

    /// Drop every entry, value and message of the context's session.
    pub async fn clear_session(&self, ctx: &RequestContext) -> Result<bool> {
        let session = ctx.session()?;
        ctx.check()?;
        let existed = self.inner.memory.clear_session(session).await;
        info!("Cleared session {session}");
        Ok(existed)
    }

    // ---- Personal memory ----

    /// Store content in the session's personal memory.
    pub async fn store(
        &self,
        ctx: &RequestContext,
        content: &str,
        tags: &[String],
    ) -> Result<MemoryEntry> {
        let session = ctx.session()?;
        ctx.run(async {
            let embedding = self.inner.adapter.embed_one(content).await?;
            self.inner.memory.insert(session, content, tags, embedding).await
        })
        .await
    }

    /// Personal memory entries most relevant to `text`.
    pub async fn query(
        &self,
        ctx: &RequestContext,
        text: &str,
        limit: usize,
    ) -> Result<Vec<PersonalResult>> {
        let session = ctx.session()?;
        let started = self.inner.start_search(SearchKind::Personal, text);
        let outcome = ctx
            .run(async {
                let embedding = self.inner.adapter.embed_one(text).await?;
                self.personal_search(session, &embedding, limit).await
            })
            .await;
        self.inner
            .finish_search(SearchKind::Personal, text, started, &outcome, |results| {
                (results.len(), false)
            });
        outcome
    }

    /// Make one of the session's entries visible to every session.
    pub async fn promote(&self, ctx: &RequestContext, entry_id: &str) -> Result<MemoryEntry> {
        let session = ctx.session()?;
        ctx.check()?;
        self.inner.memory.promote(session, entry_id).await
    }

    /// Bind `key` to `value` in the session.
    pub async fn remember(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: impl Into<MetadataValue>,
    ) -> Result<()> {
        let session = ctx.session()?;
        ctx.check()?;
        self.inner.memory.remember(session, key, value.into()).await
    }

    /// The value bound to `key`, or [`RetrievalError::NotFound`].
    pub async fn recall(&self, ctx: &RequestContext, key: &str) -> Result<MetadataValue> {
        let session = ctx.session()?;
        ctx.check()?;
        self.inner.memory.recall(session, key).await
    }

    // ---- Conversation ----

    pub async fn add_message(&self, ctx: &RequestContext, role: Role, content: &str) -> Result<()> {
        let session = ctx.session()?;
        ctx.check()?;
        self.inner.memory.add_message(session, role, content).await
    }

    /// The `limit` most recent messages, oldest first.
    pub async fn get_history(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<Message>> {
        let session = ctx.session()?;
        ctx.check()?;
        Ok(self.inner.memory.history(session, limit).await)
    }

    // ---- Knowledge ----

    /// Chunk, embed and commit one document. Its chunks become searchable
    /// together; a failure or cancellation leaves any previous version in
    /// place.
    pub async fn ingest_document(&self, ctx: &RequestContext, document: Document) -> Result<usize> {
        self.inner.ingest(ctx, document).await
    }

    /// Ingest documents in parallel, one worker per document.
    ///
    /// Returns the committed ids in input order. If any document fails the
    /// result is [`RetrievalError::PartialBatchFailure`]; the others stay
    /// committed.
    pub async fn ingest_documents(
        &self,
        ctx: &RequestContext,
        documents: Vec<Document>,
    ) -> Result<Vec<String>> {
        let total = documents.len();
        let mut seen = HashSet::new();
        let mut failures: Vec<(usize, IngestFailure)> = Vec::new();
        let mut task_ids = HashMap::new();
        let mut tasks = JoinSet::new();

        for (position, document) in documents.into_iter().enumerate() {
            if !seen.insert(document.id.clone()) {
                failures.push((
                    position,
                    IngestFailure {
                        error: RetrievalError::InvalidConfiguration(format!(
                            "duplicate document id {} in batch",
                            document.id
                        )),
                        document_id: document.id,
                    },
                ));
                continue;
            }

            let inner = Arc::clone(&self.inner);
            let ctx = ctx.clone();
            let document_id = document.id.clone();
            let handle = tasks.spawn(async move {
                match Arc::clone(&inner.workers).acquire_owned().await {
                    Ok(_permit) => inner.ingest(&ctx, document).await.map(|_| ()),
                    Err(_) => Err(RetrievalError::Cancelled),
                }
            });
            task_ids.insert(handle.id(), (position, document_id));
        }

        let mut committed: Vec<(usize, String)> = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, outcome) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(join_error) => (
                    join_error.id(),
                    Err(RetrievalError::Storage(format!("ingest worker failed: {join_error}"))),
                ),
            };
            let Some((position, document_id)) = task_ids.remove(&task_id) else {
                continue;
            };
            match outcome {
                Ok(()) => committed.push((position, document_id)),
                Err(error) => failures.push((position, IngestFailure { document_id, error })),
            }
        }

        committed.sort_by_key(|(position, _)| *position);
        let committed: Vec<String> = committed.into_iter().map(|(_, id)| id).collect();
        info!(
            documents = total,
            committed = committed.len(),
            failed = failures.len(),
            "Batch ingest finished"
        );

        if failures.is_empty() {
            Ok(committed)
        } else {
            failures.sort_by_key(|(position, _)| *position);
            Err(RetrievalError::PartialBatchFailure {
                committed,
                failures: failures.into_iter().map(|(_, failure)| failure).collect(),
            })
        }
    }

    /// Remove a document's chunks from the index.
    pub async fn remove_document(&self, ctx: &RequestContext, document_id: &str) -> Result<bool> {
        ctx.check()?;
        let removed = self.inner.index.remove_document(document_id).await?;
        if removed {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            info!("Removed document {document_id}");
        }
        Ok(removed)
    }

    /// Knowledge chunks most relevant to `query`.
    pub async fn search_knowledge(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<KnowledgeResult>> {
        options.validate()?;
        let started = self.inner.start_search(SearchKind::Knowledge, query);
        let outcome = ctx
            .run(self.inner.knowledge_search(query, None, options))
            .await;
        self.inner
            .finish_search(SearchKind::Knowledge, query, started, &outcome, |(results, cached)| {
                (results.len(), *cached)
            });
        outcome.map(|(results, _)| results)
    }

    /// Search knowledge and personal memory and merge the two rankings
    /// with the configured context weights.
    pub async fn search_all(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<HybridResult> {
        options.validate()?;
        let started = self.inner.start_search(SearchKind::Hybrid, query);
        let outcome = self.hybrid_search(ctx, query, options, started).await;
        self.inner
            .finish_search(SearchKind::Hybrid, query, started, &outcome, |result| {
                (result.total_results, false)
            });
        outcome
    }

    async fn hybrid_search(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &SearchOptions,
        started: Instant,
    ) -> Result<HybridResult> {
        let config = &self.inner.config.context;
        let (knowledge, personal) = ctx.run(self.gather(ctx, query, options)).await?;
        let ranked = HybridRanker::new()
            .with_diversity(config.diversity_threshold)
            .merge(
                knowledge.clone(),
                personal.clone(),
                config.knowledge_weight,
                config.personal_weight,
            )?;

        Ok(HybridResult {
            query: query.to_string(),
            total_results: ranked.len(),
            personal,
            knowledge,
            ranked,
            search_time: started.elapsed(),
        })
    }

    /// Assemble a token-bounded context for `query` from both stores and
    /// the session's recent conversation.
    ///
    /// Unless the options say otherwise, candidates are gathered with the
    /// context score threshold and a limit derived from `max_tokens`, so
    /// the budget decides what is kept.
    pub async fn build_context(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &ContextOptions,
    ) -> Result<RagContext> {
        options.validate()?;
        let started = self.inner.start_search(SearchKind::Context, query);
        let outcome = self.assemble_context(ctx, query, options, started).await;
        self.inner
            .finish_search(SearchKind::Context, query, started, &outcome, |context| {
                (context.knowledge.len() + context.personal.len(), false)
            });
        outcome
    }

    async fn assemble_context(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &ContextOptions,
        started: Instant,
    ) -> Result<RagContext> {
        let search = options.candidate_search(&self.inner.config.context);
        let (knowledge, personal) = ctx.run(self.gather(ctx, query, &search)).await?;
        let ranked = HybridRanker::new()
            .with_diversity(options.diversity_threshold)
            .merge(knowledge, personal, options.knowledge_weight, options.personal_weight)?;
        let history = match ctx.session() {
            Ok(session) => self.inner.memory.history(session, options.history_limit).await,
            Err(_) => Vec::new(),
        };

        let mut context = ContextAssembler::assemble(query, &ranked, &history, options);
        context.build_time = started.elapsed();
        debug!(
            "Built context for {query:?}: {} tokens, {} knowledge, {} personal, {} turns",
            context.token_count,
            context.knowledge.len(),
            context.personal.len(),
            context.history.len()
        );
        Ok(context)
    }

    // ---- Cache & stats ----

    /// Drop cached search results. Cached embeddings are kept.
    pub async fn clear_search_cache(&self) -> Result<()> {
        self.inner.search_cache.clear().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            index: self.inner.index.stats().await?,
            memory: self.inner.memory.stats().await,
            adapter: self.inner.adapter.stats(),
            embedding_cache: self.inner.adapter.cache().stats(),
            search_cache: self.inner.search_cache.stats(),
            index_generation: self.inner.generation.load(Ordering::SeqCst),
        })
    }

    /// Knowledge and personal candidates for a hybrid query. The query is
    /// embedded once and shared by both searches.
    async fn gather(
        &self,
        ctx: &RequestContext,
        query: &str,
        options: &SearchOptions,
    ) -> Result<(Vec<KnowledgeResult>, Vec<PersonalResult>)> {
        options.validate()?;
        let session = if options.include_personal {
            Some(ctx.session()?)
        } else {
            None
        };

        let embedding = self.inner.adapter.embed_one(query).await?;
        let knowledge = if options.include_knowledge {
            self.inner
                .knowledge_search(query, Some(&embedding), options)
                .await?
                .0
        } else {
            Vec::new()
        };
        let personal = match session {
            Some(session) => {
                let limit = options.limit.unwrap_or(self.inner.config.memory.max_results);
                self.personal_search(session, &embedding, limit).await?
            }
            None => Vec::new(),
        };
        Ok((knowledge, personal))
    }

    async fn personal_search(
        &self,
        session: &SessionId,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<PersonalResult>> {
        self.inner
            .memory
            .search(
                session,
                embedding,
                limit,
                self.inner.config.memory.score_threshold,
            )
            .await
    }
}

impl EngineInner {
    fn start_search(&self, kind: SearchKind, query: &str) -> Instant {
        self.observers.search_started(SearchStarted {
            kind,
            query: query.to_string(),
        });
        Instant::now()
    }

    /// Report the end of a search that [`Self::start_search`] announced,
    /// whether it succeeded or not. `summary` yields the result count and
    /// whether the results were cached.
    fn finish_search<T>(
        &self,
        kind: SearchKind,
        query: &str,
        started: Instant,
        outcome: &Result<T>,
        summary: impl FnOnce(&T) -> (usize, bool),
    ) {
        let (results, cached) = outcome.as_ref().map_or((0, false), summary);
        self.observers.search_finished(SearchFinished {
            kind,
            query: query.to_string(),
            results,
            elapsed: started.elapsed(),
            cached,
            error: outcome.as_ref().err().map(ToString::to_string),
        });
    }

    async fn ingest(&self, ctx: &RequestContext, document: Document) -> Result<usize> {
        let started = Instant::now();
        let document_id = document.id.clone();
        self.observers.ingest_started(IngestStarted {
            document_id: document_id.clone(),
        });

        let result = ctx.run(self.commit(document)).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(chunks) => info!(
                document_id = %document_id,
                chunks = *chunks,
                elapsed_ms = elapsed.as_millis() as u64,
                "Ingested document"
            ),
            Err(e) => warn!(document_id = %document_id, "Failed to ingest document: {e}"),
        }

        self.observers.ingest_finished(IngestFinished {
            document_id,
            chunks: *result.as_ref().unwrap_or(&0),
            elapsed,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Everything up to the commit can be abandoned; the commit itself
    /// replaces the document in one step.
    async fn commit(&self, document: Document) -> Result<usize> {
        document.validate()?;
        let chunks = self.chunker.chunk(&document);
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.adapter.embed(&texts).await?;

        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();
        let count = indexed.len();
        self.index.commit_document(&document.id, indexed).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(count)
    }

    /// Knowledge search served from the search cache when possible. The
    /// query is embedded only on a miss unless the caller already has the
    /// vector. Returns whether the results came from the cache.
    async fn knowledge_search(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        options: &SearchOptions,
    ) -> Result<(Vec<KnowledgeResult>, bool)> {
        let request = SearchRequest::new(
            options.limit.unwrap_or(self.config.index.max_results),
            options
                .score_threshold
                .unwrap_or(self.config.index.score_threshold),
        )
        .with_filter(options.filter.clone());

        let key = CacheKey::for_operation(
            SEARCH_NAMESPACE,
            &SearchIdentity {
                instance: &self.instance,
                generation: self.generation.load(Ordering::SeqCst),
                model: self.adapter.model(),
                query,
                limit: request.limit,
                score_threshold: request.score_threshold,
                filter: &request.filter,
            },
        )?;

        if let Some(results) = self.search_cache.get(&key).await {
            debug!("Search cache hit for {query:?}");
            return Ok((results, true));
        }

        let results = match embedding {
            Some(embedding) => self.index.search(embedding, &request).await?,
            None => {
                let embedding = self.adapter.embed_one(query).await?;
                self.index.search(&embedding, &request).await?
            }
        };
        if let Err(e) = self.search_cache.set(&key, results.clone()).await {
            warn!("Failed to cache search results: {e}");
        }
        Ok((results, false))
    }
}

/// Builder for [`MemoryEngine`].
///
/// Backends default to what the configuration names; any of them can be
/// replaced, which is how tests plug in scripted providers.
pub struct MemoryEngineBuilder {
    config: EngineConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    index: Option<Arc<dyn VectorIndex>>,
    external_cache: Option<Arc<dyn ExternalCache>>,
    observers: Observers,
}

impl MemoryEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            index: None,
            external_cache: None,
            observers: Observers::default(),
        }
    }

    /// Use this embedding provider instead of the configured one.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use this vector index instead of the configured backend.
    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// External service backing the L2 cache tier.
    pub fn with_external_cache(mut self, cache: Arc<dyn ExternalCache>) -> Self {
        self.external_cache = Some(cache);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the engine.
    pub async fn build(self) -> Result<MemoryEngine> {
        let config = self.config;
        config.validate()?;
        info!("Initializing memory engine");

        let provider = match self.provider {
            Some(provider) => provider,
            None => config.embedding.build_provider()?,
        };
        let dimension = config.embedding.dimensions.unwrap_or(provider.dimension());

        let embedding_cache = Arc::new(
            TieredCache::from_config(
                EMBEDDING_NAMESPACE,
                &config.cache,
                self.external_cache.clone(),
            )
            .await?,
        );
        let search_cache = Arc::new(
            TieredCache::from_config(SEARCH_NAMESPACE, &config.cache, self.external_cache).await?,
        );

        let mut adapter_config = AdapterConfig::new(dimension)
            .with_max_batch_size(config.embedding.max_batch_size)
            .with_acquire_timeout(config.embedding.acquire_timeout());
        if let Some(rate) = config.embedding.requests_per_second {
            adapter_config = adapter_config.with_rate_limit(rate, config.embedding.burst);
        }
        let adapter = EmbeddingAdapter::new(provider, Arc::clone(&embedding_cache), adapter_config)?;

        let index: Arc<dyn VectorIndex> = match self.index {
            Some(index) => index,
            None => match config.index.backend {
                IndexBackend::Memory => Arc::new(InMemoryVectorIndex::new(dimension)),
                IndexBackend::Sqlite => {
                    let url = config.index.url.as_deref().ok_or_else(|| {
                        RetrievalError::InvalidConfiguration(
                            "index.url is required for sqlite".to_string(),
                        )
                    })?;
                    Arc::new(SqliteVectorIndex::connect(url, dimension).await?)
                }
            },
        };
        if index.dimension() != dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: dimension,
                actual: index.dimension(),
            });
        }

        let shutdown = CancellationToken::new();
        let sweep_interval = config.cache.sweep_interval();
        if embedding_cache.is_enabled() {
            embedding_cache.spawn_sweeper(sweep_interval, shutdown.child_token());
        }
        if search_cache.is_enabled() {
            search_cache.spawn_sweeper(sweep_interval, shutdown.child_token());
        }

        info!(
            "Memory engine ready (provider: {}, model: {}, dimension: {dimension}, index: {})",
            adapter.provider_name(),
            adapter.model(),
            index.name()
        );

        Ok(MemoryEngine {
            inner: Arc::new(EngineInner {
                chunker: Chunker::new(config.chunking.chunker_config())?,
                memory: PersonalMemoryStore::new(dimension),
                workers: Arc::new(Semaphore::new(config.ingest.workers)),
                instance: uuid::Uuid::new_v4().to_string(),
                generation: AtomicU64::new(0),
                adapter,
                index,
                search_cache,
                observers: self.observers,
                shutdown,
                config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, EmbeddingConfig};
    use crate::observer::{ChannelObserver, EngineEvent};
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_embedding(EmbeddingConfig::hashing(64).with_rate_limit(None, 1))
            .with_chunking(ChunkingConfig::new(200, 20))
    }

    async fn engine() -> MemoryEngine {
        MemoryEngine::new(config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let engine = engine().await;
        assert_eq!(engine.dimension(), 64);
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.index, IndexStats::default());
        assert_eq!(stats.index_generation, 0);
    }

    #[tokio::test]
    async fn test_builder_rejects_index_with_other_dimension() {
        let result = MemoryEngine::builder(config())
            .with_index(Arc::new(InMemoryVectorIndex::new(32)))
            .build()
            .await;
        assert!(matches!(
            result,
            Err(RetrievalError::DimensionMismatch { expected: 64, actual: 32 })
        ));
    }

    #[tokio::test]
    async fn test_personal_memory_requires_session() {
        let engine = engine().await;
        let err = engine
            .store(&RequestContext::new(), "note", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_search_cache_invalidated_by_ingest() {
        let engine = engine().await;
        let ctx = RequestContext::new();
        let options = SearchOptions::new().with_score_threshold(0.0);

        engine
            .ingest_document(&ctx, Document::new("a", "rust ownership and borrowing"))
            .await
            .unwrap();
        let first = engine.search_knowledge(&ctx, "ownership", &options).await.unwrap();
        let repeat = engine.search_knowledge(&ctx, "ownership", &options).await.unwrap();
        assert_eq!(first, repeat);
        assert_eq!(engine.stats().await.unwrap().search_cache.l1_hits, 1);

        engine
            .ingest_document(&ctx, Document::new("b", "ownership rules for references"))
            .await
            .unwrap();
        let after = engine.search_knowledge(&ctx, "ownership", &options).await.unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_document() {
        let engine = engine().await;
        let ctx = RequestContext::new();
        engine
            .ingest_document(&ctx, Document::new("a", "temporary notes"))
            .await
            .unwrap();

        assert!(engine.remove_document(&ctx, "a").await.unwrap());
        let results = engine
            .search_knowledge(&ctx, "temporary notes", &SearchOptions::new().with_score_threshold(0.0))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_rejected() {
        let engine = engine().await;
        let err = engine
            .ingest_document(&RequestContext::new(), Document::new("a", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_batch_reports_partial_failure() {
        let engine = engine().await;
        let documents = vec![
            Document::new("good-1", "first document"),
            Document::new("bad", ""),
            Document::new("good-2", "second document"),
            Document::new("good-1", "duplicate id"),
        ];

        let err = engine
            .ingest_documents(&RequestContext::new(), documents)
            .await
            .unwrap_err();

        let RetrievalError::PartialBatchFailure { committed, failures } = err else {
            panic!("expected partial failure");
        };
        assert_eq!(committed, vec!["good-1".to_string(), "good-2".to_string()]);
        let failed: Vec<&str> = failures.iter().map(|f| f.document_id.as_str()).collect();
        assert_eq!(failed, vec!["bad", "good-1"]);
        assert_eq!(engine.stats().await.unwrap().index.documents, 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_commits_nothing() {
        let engine = engine().await;
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::new().with_cancellation(token);

        let err = engine
            .ingest_document(&ctx, Document::new("a", "never lands"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Cancelled));
        assert_eq!(engine.stats().await.unwrap().index, IndexStats::default());
    }

    #[tokio::test]
    async fn test_observer_sees_lifecycle() {
        let (observer, mut events) = ChannelObserver::new(16);
        let engine = MemoryEngine::builder(config())
            .with_observer(Arc::new(observer))
            .build()
            .await
            .unwrap();
        let ctx = RequestContext::new();

        engine
            .ingest_document(&ctx, Document::new("a", "observed text"))
            .await
            .unwrap();
        engine
            .search_knowledge(&ctx, "observed", &SearchOptions::new())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                EngineEvent::IngestStarted(_) => "ingest_started",
                EngineEvent::IngestFinished(e) => {
                    assert_eq!(e.chunks, 1);
                    "ingest_finished"
                }
                EngineEvent::SearchStarted(_) => "search_started",
                EngineEvent::SearchFinished(_) => "search_finished",
            });
        }
        assert_eq!(
            kinds,
            vec!["ingest_started", "ingest_finished", "search_started", "search_finished"]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ingest_is_logged() {
        let engine = engine().await;
        engine
            .ingest_document(&RequestContext::new(), Document::new("logged", "some text"))
            .await
            .unwrap();
        assert!(logs_contain("Ingested document"));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let engine = engine().await;
        let session = engine.new_session();
        let ctx = RequestContext::for_session(session);

        engine.remember(&ctx, "language", "rust").await.unwrap();
        engine.add_message(&ctx, Role::User, "hello").await.unwrap();
        assert_eq!(
            engine.recall(&ctx, "language").await.unwrap(),
            MetadataValue::from("rust")
        );

        assert!(engine.clear_session(&ctx).await.unwrap());
        assert!(engine.recall(&ctx, "language").await.unwrap_err().is_not_found());
        assert!(engine.get_history(&ctx, 10).await.unwrap().is_empty());
    }
}
