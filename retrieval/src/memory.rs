//! Session-scoped personal memory and conversation history.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use mnemo_embeddings::{Embedding, relevance_score};
use mnemo_knowledge::MetadataValue;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::context::SessionId;
use crate::error::{Result, RetrievalError};

/// A piece of content stored by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,

    /// Insertion order within the store. Breaks score ties.
    pub sequence: u64,

    pub session: SessionId,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,

    /// Visible to every session once set.
    pub promoted: bool,
}

/// A memory entry scored against a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalResult {
    pub entry: MemoryEntry,

    /// Relevance in `[0, 1]`.
    pub score: f32,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(RetrievalError::InvalidConfiguration(format!(
                "unknown message role {other}"
            ))),
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Session {
    entries: Vec<(MemoryEntry, Embedding)>,
    values: BTreeMap<String, MetadataValue>,
    messages: Vec<Message>,
}

/// Counts across all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub sessions: usize,
    pub entries: usize,
    pub values: usize,
    pub messages: usize,
}

/// In-process store for personal memory.
///
/// Every operation names its session; entries of one session are invisible
/// to others unless promoted.
pub struct PersonalMemoryStore {
    dimension: usize,
    sessions: RwLock<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl PersonalMemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual == self.dimension {
            Ok(())
        } else {
            Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual,
            })
        }
    }

    /// Store content with its embedding.
    pub async fn insert(
        &self,
        session: &SessionId,
        content: &str,
        tags: &[String],
        embedding: Embedding,
    ) -> Result<MemoryEntry> {
        self.check_dimension(embedding.len())?;
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = MemoryEntry {
            id: format!("mem-{seq}"),
            sequence: seq,
            session: session.clone(),
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at: Utc::now(),
            promoted: false,
        };
        self.sessions
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .entries
            .push((entry.clone(), embedding));
        debug!("Stored memory {} in session {session}", entry.id);
        Ok(entry)
    }

    /// Entries visible to `session`, best first. Ties go to the older entry.
    pub async fn search(
        &self,
        session: &SessionId,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<PersonalResult>> {
        self.check_dimension(query.len())?;
        let sessions = self.sessions.read().await;
        let mut results = Vec::new();
        for (owner, state) in sessions.iter() {
            let own = owner == session;
            for (entry, embedding) in &state.entries {
                if !own && !entry.promoted {
                    continue;
                }
                let score = relevance_score(query, embedding)?;
                if score >= score_threshold {
                    results.push(PersonalResult {
                        entry: entry.clone(),
                        score,
                    });
                }
            }
        }
        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.sequence.cmp(&b.entry.sequence))
        });
        results.truncate(limit);
        Ok(results)
    }

    /// Make an entry of `session` visible to every session.
    pub async fn promote(&self, session: &SessionId, entry_id: &str) -> Result<MemoryEntry> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session)
            .and_then(|state| state.entries.iter_mut().find(|(e, _)| e.id == entry_id))
            .map(|(entry, _)| entry)
            .ok_or_else(|| RetrievalError::not_found(entry_id))?;
        entry.promoted = true;
        Ok(entry.clone())
    }

    /// Bind `key` to `value`, replacing any previous value.
    pub async fn remember(&self, session: &SessionId, key: &str, value: MetadataValue) -> Result<()> {
        if key.trim().is_empty() {
            return Err(RetrievalError::InvalidConfiguration(
                "memory key must not be empty".to_string(),
            ));
        }
        value.validate().map_err(|reason| {
            RetrievalError::InvalidConfiguration(format!("value for {key}: {reason}"))
        })?;
        self.sessions
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .values
            .insert(key.to_string(), value);
        Ok(())
    }

    /// The value bound to `key`, or `NotFound`.
    pub async fn recall(&self, session: &SessionId, key: &str) -> Result<MetadataValue> {
        self.sessions
            .read()
            .await
            .get(session)
            .and_then(|state| state.values.get(key))
            .cloned()
            .ok_or_else(|| RetrievalError::not_found(key))
    }

    pub async fn add_message(&self, session: &SessionId, role: Role, content: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .messages
            .push(Message {
                role,
                content: content.to_string(),
                timestamp: Utc::now(),
            });
        Ok(())
    }

    /// The `limit` most recent messages, oldest first.
    pub async fn history(&self, session: &SessionId, limit: usize) -> Vec<Message> {
        self.sessions
            .read()
            .await
            .get(session)
            .map(|state| {
                let skip = state.messages.len().saturating_sub(limit);
                state.messages[skip..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Drop everything a session owns. Returns whether it existed.
    pub async fn clear_session(&self, session: &SessionId) -> bool {
        self.sessions.write().await.remove(session).is_some()
    }

    pub async fn stats(&self) -> MemoryStats {
        let sessions = self.sessions.read().await;
        sessions.values().fold(
            MemoryStats {
                sessions: sessions.len(),
                ..MemoryStats::default()
            },
            |mut stats, state| {
                stats.entries += state.entries.len();
                stats.values += state.values.len();
                stats.messages += state.messages.len();
                stats
            },
        )
    }
}
