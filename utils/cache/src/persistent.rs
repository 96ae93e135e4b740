//! L3: persisted tier.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;

/// One JSON file per key under a directory. Entries carry a wall-clock
/// expiry so they survive restarts and are still dropped once stale.
pub struct PersistentCache {
    dir: PathBuf,
    ttl: Duration,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry<V> {
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    value: V,
}

#[derive(Deserialize)]
struct PersistedHeader {
    expires_at: DateTime<Utc>,
}

impl PersistentCache {
    /// Open (creating if needed) a persisted cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!("Opened persisted cache at {}", dir.display());
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let path = self.path_for(key);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: PersistedEntry<V> = serde_json::from_slice(&content)?;
        if entry.expires_at <= Utc::now() {
            remove_quietly(&path).await;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    pub async fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let entry = PersistedEntry {
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            value,
        };
        let content = serde_json::to_vec(&entry)?;

        // Write then rename so readers never observe a torn file.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every persisted entry.
    pub async fn clear(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(file) = dir.next_entry().await? {
            if is_entry_file(&file.path()) {
                remove_quietly(&file.path()).await;
            }
        }
        Ok(())
    }

    /// Remove expired and unreadable entries, returning how many went.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if !is_entry_file(&path) {
                continue;
            }
            let expired = match fs::read(&path).await {
                Ok(content) => match serde_json::from_slice::<PersistedHeader>(&content) {
                    Ok(header) => header.expires_at <= now,
                    Err(e) => {
                        warn!("Dropping unreadable cache entry {}: {e}", path.display());
                        true
                    }
                },
                Err(_) => continue,
            };
            if expired {
                remove_quietly(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove cache entry {}: {e}", path.display());
    }
}
