//! Document chunking.
//!
//! Splits document text into overlapping spans. Two strategies are
//! supported: fixed-width byte windows and paragraph-aware packing that
//! prefers blank-line boundaries. Spans are snapped to UTF-8 character
//! boundaries and always tile the whole document.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::document::{Document, DocumentType, Metadata};
use crate::error::{KnowledgeError, Result};

/// A chunk of text extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,

    /// Position within the document, starting at 0.
    pub chunk_index: usize,

    /// Number of chunks the document produced.
    pub chunk_total: usize,

    /// Byte offset of the first character in the document content.
    pub start_offset: usize,

    /// Byte offset one past the last character.
    pub end_offset: usize,

    /// The actual text content.
    pub content: String,

    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,

    // Inherited from the document.
    pub title: String,
    pub source: String,
    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Stable identifier: `<document id>#<chunk index>`.
    pub fn id(&self) -> String {
        format!("{}#{}", self.document_id, self.chunk_index)
    }

    pub fn span(&self) -> Range<usize> {
        self.start_offset..self.end_offset
    }
}

/// How document text is split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStrategy {
    /// Byte windows of `chunk_size` advancing by `chunk_size - overlap`.
    #[default]
    FixedWidth,
    /// Paragraphs packed greedily up to `chunk_size`.
    ParagraphAware,
}

impl ChunkStrategy {
    /// Resolve a strategy name. Unrecognized names fall back to fixed-width.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "paragraph" | "paragraph-aware" => Self::ParagraphAware,
            _ => Self::FixedWidth,
        }
    }
}

/// Configuration for the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Target chunk size in bytes.
    pub chunk_size: usize,

    /// Bytes shared between neighbouring chunks.
    pub overlap: usize,

    /// Chunks shorter than this are merged into the following chunk. The
    /// final chunk of a document is exempt.
    pub min_chunk_size: usize,

    pub strategy: ChunkStrategy,
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_min_chunk_size(mut self, min_chunk_size: usize) -> Self {
        self.min_chunk_size = min_chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(KnowledgeError::InvalidConfiguration(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(KnowledgeError::InvalidConfiguration(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            min_chunk_size: 0,
            strategy: ChunkStrategy::FixedWidth,
        }
    }
}

/// Splits documents into [`Chunk`]s.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a chunker, rejecting unusable sizes.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk a document. Empty content yields no chunks.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let spans = self.spans(&document.content);
        let chunk_total = spans.len();
        spans
            .into_iter()
            .enumerate()
            .map(|(chunk_index, span)| {
                let content = document.content[span.clone()].to_string();
                Chunk {
                    document_id: document.id.clone(),
                    chunk_index,
                    chunk_total,
                    start_offset: span.start,
                    end_offset: span.end,
                    content_hash: content_hash(&content),
                    content,
                    title: document.title.clone(),
                    source: document.source.clone(),
                    doc_type: document.doc_type,
                    tags: document.tags.clone(),
                    metadata: document.metadata.clone(),
                    created_at: document.created_at,
                }
            })
            .collect()
    }

    /// Byte spans for `text`, in order.
    pub fn spans(&self, text: &str) -> Vec<Range<usize>> {
        if text.is_empty() {
            return Vec::new();
        }
        let spans = match self.config.strategy {
            ChunkStrategy::FixedWidth => {
                fixed_width_spans(text, 0..text.len(), self.config.chunk_size, self.config.overlap)
            }
            ChunkStrategy::ParagraphAware => {
                paragraph_spans(text, self.config.chunk_size, self.config.overlap)
            }
        };
        merge_short_spans(spans, self.config.min_chunk_size)
    }
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Windows over `range` of `text`, each at most `size` bytes, consecutive
/// windows sharing `overlap` bytes.
fn fixed_width_spans(text: &str, range: Range<usize>, size: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = range.start;
    loop {
        let mut end = floor_char_boundary(text, (start + size).min(range.end));
        if end <= start {
            // A single character wider than the window.
            end = ceil_char_boundary(text, start + 1).min(range.end);
        }
        spans.push(start..end);
        if end >= range.end {
            break;
        }
        let next = ceil_char_boundary(text, end - overlap.min(end));
        start = if next > start { next } else { end };
    }
    spans
}

/// Pack paragraphs greedily, carrying `overlap` trailing bytes of each
/// chunk into the next. Paragraphs too large for one chunk are split into
/// fixed-width windows.
fn paragraph_spans(text: &str, size: usize, overlap: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut end: Option<usize> = None;

    for paragraph in paragraph_ranges(text) {
        if paragraph.end - start <= size {
            end = Some(paragraph.end);
            continue;
        }

        if let Some(current_end) = end.take() {
            spans.push(start..current_end);
            let carried = ceil_char_boundary(text, current_end - overlap.min(current_end));
            start = if carried > start { carried } else { current_end };
            if paragraph.end - start <= size {
                end = Some(paragraph.end);
                continue;
            }
        }

        let mut pieces = fixed_width_spans(text, start..paragraph.end, size, overlap);
        if let Some(last) = pieces.pop() {
            spans.extend(pieces);
            start = last.start;
            end = Some(last.end);
        }
    }

    // The last chunk runs to the end so trailing whitespace is covered.
    if end.is_some() || start < text.len() {
        spans.push(start..text.len());
    }
    spans
}

/// Byte ranges of non-blank paragraphs, separated by blank lines.
fn paragraph_ranges(text: &str) -> Vec<Range<usize>> {
    let mut paragraphs = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            if let Some(paragraph) = current.take() {
                paragraphs.push(paragraph);
            }
            continue;
        }
        let line_end = line_start + line.trim_end_matches(['\n', '\r']).len();
        match current.as_mut() {
            Some(paragraph) => paragraph.end = line_end,
            None => current = Some(line_start..line_end),
        }
    }
    if let Some(paragraph) = current {
        paragraphs.push(paragraph);
    }
    paragraphs
}

/// Fold spans shorter than `min` into the span that follows them.
fn merge_short_spans(spans: Vec<Range<usize>>, min: usize) -> Vec<Range<usize>> {
    if min == 0 {
        return spans;
    }
    let last = spans.len().saturating_sub(1);
    let mut merged = Vec::with_capacity(spans.len());
    let mut pending_start: Option<usize> = None;
    for (i, span) in spans.into_iter().enumerate() {
        let candidate = pending_start.take().unwrap_or(span.start)..span.end;
        if candidate.len() < min && i != last {
            pending_start = Some(candidate.start);
            continue;
        }
        merged.push(candidate);
    }
    merged
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunker(size: usize, overlap: usize, strategy: ChunkStrategy) -> Chunker {
        Chunker::new(ChunkerConfig::new(size, overlap).with_strategy(strategy)).unwrap()
    }

    /// Every byte is covered and neighbours never overlap by more than `overlap`.
    fn assert_tiles(text: &str, spans: &[Range<usize>], overlap: usize) {
        assert_eq!(spans.first().map(|s| s.start), Some(0));
        assert_eq!(spans.last().map(|s| s.end), Some(text.len()));
        for pair in spans.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between {pair:?}");
            assert!(pair[0].end - pair[1].start <= overlap, "overlap too wide {pair:?}");
            assert!(pair[1].start > pair[0].start, "no progress {pair:?}");
        }
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(Chunker::new(ChunkerConfig::new(0, 0)).is_err());
        assert!(Chunker::new(ChunkerConfig::new(100, 100)).is_err());
        assert!(Chunker::new(ChunkerConfig::new(100, 99)).is_ok());
    }

    #[test]
    fn test_three_thousand_chars_make_four_chunks() {
        let text = "x".repeat(3000);
        let doc = Document::new("doc", text.clone());
        let chunks = chunker(1000, 200, ChunkStrategy::FixedWidth).chunk(&doc);

        assert_eq!(chunks.len(), 4);
        let spans: Vec<Range<usize>> = chunks.iter().map(Chunk::span).collect();
        assert_eq!(spans, vec![0..1000, 800..1800, 1600..2600, 2400..3000]);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 200);
        }
        assert!(chunks.iter().all(|c| c.chunk_total == 4));
        assert_eq!(
            chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_short_document_is_one_chunk() {
        let doc = Document::new("doc", "tiny");
        let chunks = chunker(1000, 200, ChunkStrategy::FixedWidth).chunk(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "tiny");
        assert_eq!(chunks[0].id(), "doc#0");
    }

    #[test]
    fn test_fixed_width_count_formula() {
        for (len, size, overlap) in [(3000, 1000, 200), (2500, 500, 100), (1001, 1000, 0), (7777, 300, 50)] {
            let text = "y".repeat(len);
            let spans = chunker(size, overlap, ChunkStrategy::FixedWidth).spans(&text);
            let expected = (len - overlap).div_ceil(size - overlap);
            assert!(spans.len().abs_diff(expected) <= 1, "{len}/{size}/{overlap}");
            assert_tiles(&text, &spans, overlap);
        }
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(500);
        let doc = Document::new("doc", text.clone());
        let chunks = chunker(101, 10, ChunkStrategy::FixedWidth).chunk(&doc);

        assert!(chunks.len() > 1);
        let spans: Vec<Range<usize>> = chunks.iter().map(Chunk::span).collect();
        assert_tiles(&text, &spans, 10);
        assert!(chunks.iter().all(|c| c.content.chars().all(|ch| ch == 'é')));
    }

    #[test]
    fn test_paragraphs_packed_up_to_size() {
        let para = "word ".repeat(19) + "word"; // 99 bytes
        let text = [para.as_str(); 5].join("\n\n");
        let spans = chunker(250, 20, ChunkStrategy::ParagraphAware).spans(&text);

        assert_tiles(&text, &spans, 20);
        // Two paragraphs plus the separator fit in 250 bytes; three do not.
        assert_eq!(&text[spans[0].clone()], format!("{para}\n\n{para}"));
        assert!(spans.iter().all(|s| s.len() <= 250));
    }

    #[test]
    fn test_oversized_paragraph_falls_back_to_windows() {
        let text = format!("short intro\n\n{}\n\nshort outro", "z".repeat(450));
        let spans = chunker(200, 50, ChunkStrategy::ParagraphAware).spans(&text);

        assert_tiles(&text, &spans, 50);
        assert!(spans.iter().all(|s| s.len() <= 200));
    }

    #[test]
    fn test_short_candidates_merge_forward() {
        let text = "a\n\nbbbbbbbbbbbbbbbbbbbb\n\ncc";
        let config = ChunkerConfig::new(10, 0)
            .with_strategy(ChunkStrategy::ParagraphAware)
            .with_min_chunk_size(5);
        let spans = Chunker::new(config).unwrap().spans(text);

        assert_tiles(text, &spans, 0);
        assert!(spans[0].len() >= 5);
        // The final chunk is kept even when short.
        assert_eq!(&text[spans.last().unwrap().clone()], "bb\n\ncc");
    }

    #[test]
    fn test_unknown_strategy_falls_back() {
        assert_eq!(ChunkStrategy::from_name("semantic"), ChunkStrategy::FixedWidth);
        assert_eq!(
            ChunkStrategy::from_name("Paragraph_Aware"),
            ChunkStrategy::ParagraphAware
        );
    }

    #[test]
    fn test_chunks_inherit_document_fields() {
        let doc = Document::new("doc", "content here")
            .with_source("notes.md")
            .with_type(DocumentType::Markdown)
            .with_tag("notes");
        let chunk = &chunker(100, 10, ChunkStrategy::FixedWidth).chunk(&doc)[0];

        assert_eq!(chunk.source, "notes.md");
        assert_eq!(chunk.doc_type, DocumentType::Markdown);
        assert_eq!(chunk.tags, vec!["notes".to_string()]);
        assert_eq!(chunk.content_hash, content_hash("content here"));
    }
}
