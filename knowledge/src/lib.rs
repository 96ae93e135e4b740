//! # Knowledge
//!
//! Documents, chunking and vector indexes.
//!
//! A [`Document`] is validated at the ingestion boundary, split into
//! overlapping [`Chunk`]s by the [`Chunker`], and committed to a
//! [`VectorIndex`] together with the chunk embeddings. Two index backends
//! ship here: [`InMemoryVectorIndex`] for tests and single-process use, and
//! [`SqliteVectorIndex`] for a persisted store.
//!
//! ```text
//! Document ──► Chunker ──► [Chunk] ──(embeddings)──► VectorIndex
//!                                                        │
//!                         query embedding + filter ──────┴──► [KnowledgeResult]
//! ```

pub mod chunker;
pub mod document;
pub mod error;
pub mod index;

pub use chunker::{Chunk, ChunkStrategy, Chunker, ChunkerConfig, content_hash};
pub use document::{Document, DocumentType, MAX_METADATA_DEPTH, Metadata, MetadataValue, validate_metadata};
pub use error::{KnowledgeError, Result};
pub use index::{
    InMemoryVectorIndex, IndexStats, IndexedChunk, KnowledgeResult, SearchFilter, SearchRequest,
    SqliteVectorIndex, VectorIndex,
};
