//! L2: external cache service.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::Result;

/// A shared cache service reachable from every engine instance, such as a
/// Redis or Memcached deployment. Values are opaque bytes with a TTL.
#[async_trait]
pub trait ExternalCache: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop expired entries. Services with native expiry return 0.
    async fn sweep(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Process-local stand-in for an external cache service.
#[derive(Default)]
pub struct InProcessExternalCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl InProcessExternalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ExternalCache for InProcessExternalCache {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > now {
                return Ok(Some(value.clone()));
            }
        }
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}
