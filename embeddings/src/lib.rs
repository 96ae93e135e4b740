//! # Embeddings
//!
//! This crate turns text into fixed-dimension vectors for the memory and
//! knowledge retrieval engine.
//!
//! ## Features
//!
//! - **Multiple Providers**: OpenAI, Ollama and an offline hashing provider
//! - **Batching**: requests capped at a maximum batch size, sent sequentially
//! - **Caching**: every text is looked up by content hash before any request
//! - **Backpressure**: token-bucket rate limiting with a bounded wait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  texts ──► EmbeddingAdapter ──cache miss──► TokenBucket         │
//! │                 │                               │               │
//! │                 ▼                               ▼               │
//! │           TieredCache                  EmbeddingProvider        │
//! │                                   (OpenAI / Ollama / Hashing)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod error;
pub mod hashing;
pub mod limiter;
pub mod provider;
pub mod similarity;

pub use adapter::{AdapterConfig, AdapterStats, EMBEDDING_NAMESPACE, EmbeddingAdapter};
pub use error::{EmbeddingError, Result};
pub use hashing::HashingProvider;
pub use limiter::TokenBucket;
pub use provider::{EmbeddingProvider, OllamaProvider, OpenAIProvider};
pub use similarity::{cosine_similarity, normalize, relevance_score};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

