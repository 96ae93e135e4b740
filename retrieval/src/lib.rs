//! # Retrieval Engine
//!
//! This crate provides the memory and knowledge retrieval engine that combines:
//!
//! - **Knowledge**: Chunked documents in a vector index
//! - **Personal Memory**: Session-scoped entries, values and conversation
//! - **Embeddings**: Cached, rate-limited vectors from a pluggable provider
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Memory Engine                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Knowledge   │  │  Embedding   │  │   Personal   │           │
//! │  │    Index     │  │   Adapter    │  │    Memory    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                │                  │                   │
//! │         └────────────────┼──────────────────┘                   │
//! │                          ▼                                      │
//! │                  ┌──────────────┐                               │
//! │                  │    Hybrid    │                               │
//! │                  │    Ranker    │                               │
//! │                  └──────────────┘                               │
//! │                          │                                      │
//! │                          ▼                                      │
//! │                  ┌──────────────┐                               │
//! │                  │   Context    │                               │
//! │                  │  Assembler   │                               │
//! │                  └──────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mnemo_retrieval::{ContextOptions, Document, EngineConfig, MemoryEngine, RequestContext};
//!
//! let engine = MemoryEngine::new(EngineConfig::default()).await?;
//! let ctx = RequestContext::for_session(engine.new_session());
//!
//! engine.ingest_document(&ctx, Document::new("faq", "Paris is the capital of France.")).await?;
//! engine.store(&ctx, "The user lives in Lyon", &[]).await?;
//!
//! let context = engine
//!     .build_context(&ctx, "What is the capital of France?", &ContextOptions::default())
//!     .await?;
//! println!("{}", context.text);
//! ```

pub mod assembler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod observer;
pub mod options;
pub mod ranker;

pub use assembler::{ContextAssembler, RagContext, count_tokens};
pub use config::{
    ChunkingConfig, ContextConfig, EmbeddingConfig, EmbeddingProviderType, EngineConfig,
    IndexBackend, IndexConfig, IngestConfig, MemoryConfig,
};
pub use context::{RequestContext, SessionId};
pub use engine::{EngineStats, HybridResult, MemoryEngine, MemoryEngineBuilder, SEARCH_NAMESPACE};
pub use error::{IngestFailure, Result, RetrievalError};
pub use memory::{MemoryEntry, MemoryStats, Message, PersonalMemoryStore, PersonalResult, Role};
pub use observer::{
    ChannelObserver, EngineEvent, EngineObserver, IngestFinished, IngestStarted, SearchFinished,
    SearchKind, SearchStarted,
};
pub use options::{ContextOptions, SearchOptions};
pub use ranker::{HybridRanker, RankedItem, RankedResult};

// Re-export from dependencies for convenience
pub use mnemo_embeddings::{EmbeddingProvider, HashingProvider};
pub use mnemo_knowledge::{
    Document, DocumentType, KnowledgeResult, Metadata, MetadataValue, SearchFilter, VectorIndex,
};
pub use mnemo_utils_cache::{CacheConfig, ExternalCache};
