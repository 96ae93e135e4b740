//! Vector index abstraction.
//!
//! Backends store chunk embeddings keyed by `(document id, chunk index)` and
//! answer nearest-neighbour queries. All chunks of one document are written
//! through [`VectorIndex::commit_document`], which replaces the document's
//! previous chunks in a single step so a concurrent search sees either the
//! old chunk set or the new one, never a mix.

mod memory;
mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnemo_embeddings::{Embedding, relevance_score};
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::document::{DocumentType, Metadata};
use crate::error::{KnowledgeError, Result};

/// A chunk paired with its embedding, ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

/// A search hit: a read-only projection of a stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_total: usize,
    pub content: String,

    /// Relevance in `[0, 1]`.
    pub score: f32,

    pub title: String,
    pub source: String,
    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeResult {
    /// Same identifier as the chunk it was projected from.
    pub fn id(&self) -> String {
        format!("{}#{}", self.document_id, self.chunk_index)
    }

    pub(crate) fn from_chunk(chunk: &Chunk, score: f32) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            chunk_total: chunk.chunk_total,
            content: chunk.content.clone(),
            score,
            title: chunk.title.clone(),
            source: chunk.source.clone(),
            doc_type: chunk.doc_type,
            tags: chunk.tags.clone(),
            metadata: chunk.metadata.clone(),
            created_at: chunk.created_at,
        }
    }
}

/// Conjunctive metadata filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    /// Document type must be one of these.
    pub doc_types: BTreeSet<DocumentType>,

    /// At least one chunk tag must be in this set.
    pub tags: BTreeSet<String>,

    /// Source must be one of these.
    pub sources: BTreeSet<String>,

    /// Inclusive lower bound on document creation time.
    pub created_after: Option<DateTime<Utc>>,

    /// Exclusive upper bound on document creation time.
    pub created_before: Option<DateTime<Utc>>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.doc_types.is_empty()
            && self.tags.is_empty()
            && self.sources.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if !self.doc_types.is_empty() && !self.doc_types.contains(&chunk.doc_type) {
            return false;
        }
        if !self.tags.is_empty() && !chunk.tags.iter().any(|tag| self.tags.contains(tag)) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&chunk.source) {
            return false;
        }
        if let Some(after) = self.created_after
            && chunk.created_at < after
        {
            return false;
        }
        if let Some(before) = self.created_before
            && chunk.created_at >= before
        {
            return false;
        }
        true
    }
}

/// Parameters for a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub limit: usize,

    /// Results scoring below this are excluded.
    pub score_threshold: f32,

    pub filter: SearchFilter,
}

impl SearchRequest {
    pub fn new(limit: usize, score_threshold: f32) -> Self {
        Self {
            limit,
            score_threshold,
            filter: SearchFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Counts reported by an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
}

/// Storage and similarity search over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Configured embedding dimension. Every write and query is checked
    /// against it.
    fn dimension(&self) -> usize;

    /// Insert or replace one chunk, keyed by `(document id, chunk index)`.
    async fn upsert(&self, chunk: Chunk, embedding: Embedding) -> Result<()>;

    /// Replace every chunk of `document_id` with `chunks` in one step.
    async fn commit_document(&self, document_id: &str, chunks: Vec<IndexedChunk>) -> Result<()>;

    /// Drop a document. Returns whether anything was removed.
    async fn remove_document(&self, document_id: &str) -> Result<bool>;

    /// Results ordered by descending score, ties broken by
    /// `(document id, chunk index)` ascending.
    async fn search(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<KnowledgeResult>>;

    async fn stats(&self) -> Result<IndexStats>;
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KnowledgeError::DimensionMismatch { expected, actual })
    }
}

/// Validate a document commit: dimensions, ownership and index order.
pub(crate) fn check_commit(document_id: &str, dimension: usize, chunks: &[IndexedChunk]) -> Result<()> {
    for (position, entry) in chunks.iter().enumerate() {
        check_dimension(dimension, entry.embedding.len())?;
        if entry.chunk.document_id != document_id {
            return Err(KnowledgeError::InvalidDocument {
                id: document_id.to_string(),
                reason: format!("chunk belongs to {}", entry.chunk.document_id),
            });
        }
        if entry.chunk.chunk_index != position {
            return Err(KnowledgeError::InvalidDocument {
                id: document_id.to_string(),
                reason: format!(
                    "chunk index {} out of order at position {position}",
                    entry.chunk.chunk_index
                ),
            });
        }
    }
    Ok(())
}

/// Score, filter and order candidates. Shared by every brute-force backend.
pub(crate) fn rank<'a>(
    query: &[f32],
    request: &SearchRequest,
    candidates: impl IntoIterator<Item = (&'a Chunk, &'a [f32])>,
) -> Result<Vec<KnowledgeResult>> {
    let mut results = Vec::new();
    for (chunk, embedding) in candidates {
        if !request.filter.matches(chunk) {
            continue;
        }
        let score = relevance_score(query, embedding)
            .map_err(|_| KnowledgeError::DimensionMismatch {
                expected: query.len(),
                actual: embedding.len(),
            })?;
        if score < request.score_threshold {
            continue;
        }
        results.push(KnowledgeResult::from_chunk(chunk, score));
    }
    results.sort_by(compare_results);
    results.truncate(request.limit);
    Ok(results)
}

pub(crate) fn compare_results(a: &KnowledgeResult, b: &KnowledgeResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
}
