//! SQLite-backed vector index.
//!
//! Embeddings are stored as little-endian `f32` blobs next to the chunk
//! text and metadata. Search is brute force over the stored vectors; a
//! document commit is a single transaction, so readers on other
//! connections never observe a half-replaced chunk set.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnemo_embeddings::Embedding;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::{
    IndexStats, IndexedChunk, KnowledgeResult, SearchRequest, VectorIndex, check_commit,
    check_dimension, rank,
};
use crate::chunker::Chunk;
use crate::document::DocumentType;
use crate::error::{KnowledgeError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    document_id   TEXT    NOT NULL,
    chunk_index   INTEGER NOT NULL,
    chunk_total   INTEGER NOT NULL,
    start_offset  INTEGER NOT NULL,
    end_offset    INTEGER NOT NULL,
    content       TEXT    NOT NULL,
    content_hash  TEXT    NOT NULL,
    title         TEXT    NOT NULL,
    source        TEXT    NOT NULL,
    doc_type      TEXT    NOT NULL,
    tags_json     TEXT    NOT NULL,
    metadata_json TEXT    NOT NULL,
    created_at    INTEGER NOT NULL,
    embedding     BLOB    NOT NULL,
    PRIMARY KEY (document_id, chunk_index)
)
"#;

const INSERT_CHUNK: &str = r#"
INSERT INTO chunks (document_id, chunk_index, chunk_total, start_offset, end_offset,
                    content, content_hash, title, source, doc_type, tags_json,
                    metadata_json, created_at, embedding)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(document_id, chunk_index) DO UPDATE SET
    chunk_total = excluded.chunk_total,
    start_offset = excluded.start_offset,
    end_offset = excluded.end_offset,
    content = excluded.content,
    content_hash = excluded.content_hash,
    title = excluded.title,
    source = excluded.source,
    doc_type = excluded.doc_type,
    tags_json = excluded.tags_json,
    metadata_json = excluded.metadata_json,
    created_at = excluded.created_at,
    embedding = excluded.embedding
"#;

/// Vector index persisted in a SQLite database.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteVectorIndex {
    /// Connect to `url` (a file path, `sqlite:` URL or `:memory:`) and
    /// create the schema if missing.
    pub async fn connect(url: &str, dimension: usize) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite:{url}")
        };
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

        // Each connection to `:memory:` is a separate database, so keep
        // exactly one alive for the lifetime of the pool.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await?
        };

        sqlx::query(SCHEMA).execute(&pool).await?;
        info!("Opened SQLite vector index at {url}");
        Ok(Self { pool, dimension })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk, embedding: &[f32]) -> Result<()> {
        sqlx::query(INSERT_CHUNK)
            .bind(&chunk.document_id)
            .bind(to_sql_int("chunk_index", chunk.chunk_index)?)
            .bind(to_sql_int("chunk_total", chunk.chunk_total)?)
            .bind(to_sql_int("start_offset", chunk.start_offset)?)
            .bind(to_sql_int("end_offset", chunk.end_offset)?)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(&chunk.title)
            .bind(&chunk.source)
            .bind(chunk.doc_type.as_str())
            .bind(serde_json::to_string(&chunk.tags)?)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(chunk.created_at.timestamp_millis())
            .bind(vec_to_blob(embedding))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, chunk: Chunk, embedding: Embedding) -> Result<()> {
        check_dimension(self.dimension, embedding.len())?;
        let mut tx = self.pool.begin().await?;
        Self::insert(&mut tx, &chunk, &embedding).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_document(&self, document_id: &str, chunks: Vec<IndexedChunk>) -> Result<()> {
        check_commit(document_id, self.dimension, &chunks)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for entry in &chunks {
            Self::insert(&mut tx, &entry.chunk, &entry.embedding).await?;
        }
        tx.commit().await?;
        debug!("Committed {} chunks for {document_id}", chunks.len());
        Ok(())
    }

    async fn remove_document(&self, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, query: &[f32], request: &SearchRequest) -> Result<Vec<KnowledgeResult>> {
        check_dimension(self.dimension, query.len())?;
        let rows = sqlx::query("SELECT * FROM chunks ORDER BY document_id, chunk_index")
            .fetch_all(&self.pool)
            .await?;
        let stored = rows
            .iter()
            .map(|row| Ok((chunk_from_row(row)?, blob_to_vec(row.try_get("embedding")?))))
            .collect::<Result<Vec<(Chunk, Embedding)>>>()?;
        rank(
            query,
            request,
            stored.iter().map(|(chunk, embedding)| (chunk, embedding.as_slice())),
        )
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT document_id) AS documents, COUNT(*) AS chunks FROM chunks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(IndexStats {
            documents: usize_column(&row, "documents")?,
            chunks: usize_column(&row, "chunks")?,
        })
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let document_id: String = row.try_get("document_id")?;
    let doc_type: String = row.try_get("doc_type")?;
    let doc_type = DocumentType::from_str(&doc_type)
        .map_err(|_| KnowledgeError::CorruptRow(format!("{document_id}: document type {doc_type}")))?;
    let created_millis: i64 = row.try_get("created_at")?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_millis)
        .ok_or_else(|| KnowledgeError::CorruptRow(format!("{document_id}: timestamp {created_millis}")))?;
    let tags_json: String = row.try_get("tags_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;

    Ok(Chunk {
        chunk_index: usize_column(row, "chunk_index")?,
        chunk_total: usize_column(row, "chunk_total")?,
        start_offset: usize_column(row, "start_offset")?,
        end_offset: usize_column(row, "end_offset")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        title: row.try_get("title")?,
        source: row.try_get("source")?,
        doc_type,
        tags: serde_json::from_str(&tags_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        created_at,
        document_id,
    })
}

fn to_sql_int(column: &'static str, value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| KnowledgeError::OutOfRange {
        column,
        value: value.to_string(),
    })
}

fn usize_column(row: &SqliteRow, column: &'static str) -> Result<usize> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value).map_err(|_| KnowledgeError::OutOfRange {
        column,
        value: value.to_string(),
    })
}

fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vec(blob: Vec<u8>) -> Embedding {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunker, ChunkerConfig};
    use crate::document::Document;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn indexed(doc: &Document) -> Vec<IndexedChunk> {
        Chunker::new(ChunkerConfig::new(10, 2))
            .unwrap()
            .chunk(doc)
            .into_iter()
            .map(|chunk| IndexedChunk {
                embedding: vec![1.0, chunk.chunk_index as f32, 0.0],
                chunk,
            })
            .collect()
    }

    #[test]
    fn test_blob_encoding() {
        let v = vec![0.25_f32, -1.5, 3.0];
        assert_eq!(blob_to_vec(vec_to_blob(&v)), v);
    }

    #[tokio::test]
    async fn test_round_trips_chunk_fields() {
        let index = SqliteVectorIndex::connect(":memory:", 3).await.unwrap();
        let doc = Document::new("doc", "short text")
            .with_title("Title")
            .with_source("notes.md")
            .with_type(DocumentType::Markdown)
            .with_tag("notes")
            .with_metadata("pages", 2_i64);
        index.commit_document("doc", indexed(&doc)).await.unwrap();

        let results = index
            .search(&[1.0, 0.0, 0.0], &SearchRequest::new(10, 0.0))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let hit = &results[0];
        assert_eq!(hit.content, "short text");
        assert_eq!(hit.source, "notes.md");
        assert_eq!(hit.doc_type, DocumentType::Markdown);
        assert_eq!(hit.tags, vec!["notes".to_string()]);
        assert_eq!(hit.metadata, doc.metadata);
        assert_eq!(hit.created_at.timestamp_millis(), doc.created_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_recommit_replaces_in_file_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.db");
        let index = SqliteVectorIndex::connect(&path.to_string_lossy(), 3).await.unwrap();

        let long = Document::new("doc", "x".repeat(40));
        index.commit_document("doc", indexed(&long)).await.unwrap();
        let first = index.stats().await.unwrap();
        assert_eq!(first.documents, 1);
        assert!(first.chunks > 2);

        let short = Document::new("doc", "x".repeat(8));
        index.commit_document("doc", indexed(&short)).await.unwrap();
        assert_eq!(index.stats().await.unwrap(), IndexStats { documents: 1, chunks: 1 });

        assert!(index.remove_document("doc").await.unwrap());
        assert_eq!(index.stats().await.unwrap(), IndexStats::default());
    }

    #[test]
    fn test_offsets_beyond_sql_range_rejected() {
        assert_eq!(to_sql_int("chunk_index", 7).unwrap(), 7);
        let err = to_sql_int("end_offset", usize::MAX).unwrap_err();
        assert!(matches!(err, KnowledgeError::OutOfRange { column: "end_offset", .. }));
    }

    #[tokio::test]
    async fn test_negative_stored_offset_is_an_error() {
        let index = SqliteVectorIndex::connect(":memory:", 3).await.unwrap();
        let doc = Document::new("doc", "short text");
        index.commit_document("doc", indexed(&doc)).await.unwrap();
        sqlx::query("UPDATE chunks SET start_offset = -1")
            .execute(index.pool())
            .await
            .unwrap();

        let err = index
            .search(&[1.0, 0.0, 0.0], &SearchRequest::new(10, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::OutOfRange { column: "start_offset", .. }));
    }

    #[tokio::test]
    async fn test_rejected_commit_leaves_previous_chunks() {
        let index = SqliteVectorIndex::connect(":memory:", 3).await.unwrap();
        let doc = Document::new("doc", "x".repeat(20));
        index.commit_document("doc", indexed(&doc)).await.unwrap();
        let before = index.stats().await.unwrap();

        let mut bad = indexed(&doc);
        bad[1].embedding = vec![1.0];
        assert!(index.commit_document("doc", bad).await.is_err());
        assert_eq!(index.stats().await.unwrap(), before);
    }
}
