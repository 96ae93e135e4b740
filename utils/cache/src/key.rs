//! Cache key derivation.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A content-addressed cache key.
///
/// Keys are the hex SHA-256 of a namespace plus the full identity of the
/// cached operation, so two operations differing in any parameter never
/// share a key. Hex keys are also safe to use as file names in L3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for an embedding of `text` produced by `model`.
    pub fn for_content(namespace: &str, model: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        Self(hex(&hasher.finalize()))
    }

    /// Key for an arbitrary serializable operation identity, such as a query
    /// together with its search options.
    pub fn for_operation<T: Serialize + ?Sized>(namespace: &str, identity: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(identity)?;
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(&encoded);
        Ok(Self(hex(&hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
