//! In-process vector index.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mnemo_embeddings::Embedding;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    IndexStats, IndexedChunk, KnowledgeResult, SearchRequest, VectorIndex, check_commit,
    check_dimension, rank,
};
use crate::chunker::Chunk;
use crate::error::Result;

/// Brute-force index held in memory.
///
/// Documents are stored as whole chunk sets, so a commit swaps the set
/// under one write lock.
pub struct InMemoryVectorIndex {
    dimension: usize,
    documents: RwLock<BTreeMap<String, Vec<IndexedChunk>>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Chunk indexes currently stored for a document.
    pub async fn chunk_indexes(&self, document_id: &str) -> Vec<usize> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|chunks| chunks.iter().map(|c| c.chunk.chunk_index).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "memory"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, chunk: Chunk, embedding: Embedding) -> Result<()> {
        check_dimension(self.dimension, embedding.len())?;
        let mut documents = self.documents.write().await;
        let chunks = documents.entry(chunk.document_id.clone()).or_default();
        let entry = IndexedChunk { chunk, embedding };
        match chunks.binary_search_by_key(&entry.chunk.chunk_index, |c| c.chunk.chunk_index) {
            Ok(pos) => chunks[pos] = entry,
            Err(pos) => chunks.insert(pos, entry),
        }
        Ok(())
    }

    async fn commit_document(&self, document_id: &str, chunks: Vec<IndexedChunk>) -> Result<()> {
        check_commit(document_id, self.dimension, &chunks)?;
        let count = chunks.len();
        let mut documents = self.documents.write().await;
        if chunks.is_empty() {
            documents.remove(document_id);
        } else {
            documents.insert(document_id.to_string(), chunks);
        }
        debug!("Committed {count} chunks for {document_id}");
        Ok(())
    }

    async fn remove_document(&self, document_id: &str) -> Result<bool> {
        Ok(self.documents.write().await.remove(document_id).is_some())
    }

    async fn search(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<KnowledgeResult>> {
        check_dimension(self.dimension, query.len())?;
        let documents = self.documents.read().await;
        rank(
            query,
            request,
            documents
                .values()
                .flatten()
                .map(|entry| (&entry.chunk, entry.embedding.as_slice())),
        )
    }

    async fn stats(&self) -> Result<IndexStats> {
        let documents = self.documents.read().await;
        Ok(IndexStats {
            documents: documents.len(),
            chunks: documents.values().map(Vec::len).sum(),
        })
    }
}
