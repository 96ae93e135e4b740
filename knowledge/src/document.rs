//! Documents and their typed metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeError, Result};

/// Deepest nesting allowed inside a metadata value.
pub const MAX_METADATA_DEPTH: usize = 4;

/// Metadata attached to documents and memory entries.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// The closed set of shapes a metadata value may take.
///
/// There is no null; absence is expressed by leaving the key out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    /// Check nesting depth, float finiteness and map keys.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> std::result::Result<(), String> {
        if depth > MAX_METADATA_DEPTH {
            return Err(format!("nested deeper than {MAX_METADATA_DEPTH} levels"));
        }
        match self {
            Self::Float(f) if !f.is_finite() => Err(format!("non-finite number {f}")),
            Self::List(items) => items.iter().try_for_each(|item| item.validate_at(depth + 1)),
            Self::Map(map) => validate_map(map, depth + 1),
            _ => Ok(()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn validate_map(
    map: &BTreeMap<String, MetadataValue>,
    depth: usize,
) -> std::result::Result<(), String> {
    for (key, value) in map {
        if key.trim().is_empty() {
            return Err("empty metadata key".to_string());
        }
        value
            .validate_at(depth)
            .map_err(|reason| format!("{key}: {reason}"))?;
    }
    Ok(())
}

/// Validate a whole metadata map.
pub fn validate_metadata(metadata: &Metadata) -> std::result::Result<(), String> {
    validate_map(metadata, 1)
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl TryFrom<serde_json::Value> for MetadataValue {
    type Error = String;

    fn try_from(value: serde_json::Value) -> std::result::Result<Self, Self::Error> {
        use serde_json::Value;
        match value {
            Value::Null => Err("null is not a metadata value".to_string()),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float))
                .ok_or_else(|| format!("unsupported number {n}")),
            Value::String(s) => Ok(Self::Text(s)),
            Value::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
        }
    }
}

/// Kind of content a document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "txt")]
    Text,
    #[serde(rename = "md")]
    Markdown,
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "web")]
    Web,
    /// Text extracted from a binary format such as PDF.
    #[serde(rename = "pdf")]
    Pdf,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Markdown => "md",
            Self::Code => "code",
            Self::Json => "json",
            Self::Web => "web",
            Self::Pdf => "pdf",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "txt" | "text" => Ok(Self::Text),
            "md" | "markdown" => Ok(Self::Markdown),
            "code" => Ok(Self::Code),
            "json" => Ok(Self::Json),
            "web" => Ok(Self::Web),
            "pdf" => Ok(Self::Pdf),
            other => Err(KnowledgeError::InvalidConfiguration(format!(
                "unknown document type {other}"
            ))),
        }
    }
}

/// An immutable unit of knowledge to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,

    /// Where the document came from: a path, URL or system name.
    pub source: String,

    pub doc_type: DocumentType,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create a plain-text document.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            content: content.into(),
            source: String::new(),
            doc_type: DocumentType::Text,
            tags: Vec::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_type(mut self, doc_type: DocumentType) -> Self {
        self.doc_type = doc_type;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Reject documents that cannot be ingested.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| KnowledgeError::InvalidDocument {
            id: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("empty identifier".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(invalid("empty content".to_string()));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(invalid("empty tag".to_string()));
        }
        validate_metadata(&self.metadata).map_err(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_document_builder() {
        let doc = Document::new("doc-1", "Paris is the capital of France")
            .with_title("Geography")
            .with_source("atlas")
            .with_type(DocumentType::Markdown)
            .with_tag("europe")
            .with_metadata("pages", 3_i64);

        assert_eq!(doc.doc_type, DocumentType::Markdown);
        assert_eq!(doc.tags, vec!["europe".to_string()]);
        assert_eq!(doc.metadata.get("pages"), Some(&MetadataValue::Integer(3)));
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        let err = Document::new("doc-1", "  \n").validate().unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidDocument { .. }));
    }

    #[test]
    fn test_metadata_depth_limit() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": 1}}}}});
        let value = MetadataValue::try_from(deep).unwrap();
        assert!(value.validate().is_err());

        let shallow = MetadataValue::try_from(json!({"a": [1, 2.5, "x", true]})).unwrap();
        assert!(shallow.validate().is_ok());
    }

    #[test]
    fn test_metadata_rejects_null_and_nan() {
        assert!(MetadataValue::try_from(json!(null)).is_err());
        assert!(MetadataValue::Float(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_metadata_round_trips_untagged() {
        let value = MetadataValue::try_from(json!({"n": 1, "f": 1.5, "s": "x"})).unwrap();
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(encoded, json!({"n": 1, "f": 1.5, "s": "x"}));
    }

    #[test]
    fn test_document_type_names() {
        assert_eq!("markdown".parse::<DocumentType>().unwrap(), DocumentType::Markdown);
        assert_eq!(DocumentType::Pdf.to_string(), "pdf");
        assert!("docx".parse::<DocumentType>().is_err());
    }
}
