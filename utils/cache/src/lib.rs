//! # Tiered Cache
//!
//! Multi-level cache placed in front of embedding generation and knowledge
//! search.
//!
//! ## Tiers
//!
//! - **L1**: bounded in-process map with TTL and usefulness-based eviction
//! - **L2**: larger external cache service, TTL only
//! - **L3**: persisted on disk, longest TTL
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TieredCache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   get ──► L1 ──miss──► L2 ──miss──► L3 ──miss──► None           │
//! │            ▲            │            │                          │
//! │            └─write back─┴────────────┘                          │
//! │                                                                 │
//! │   set ──► L1 + L2 + L3 (write-through, per-key section)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every tier can be enabled or disabled independently through
//! [`CacheConfig`].

pub mod config;
pub mod error;
pub mod external;
pub mod key;
pub mod memory;
pub mod persistent;
pub mod tiered;

pub use config::{CacheConfig, L1Config, L2Config, L3Config};
pub use error::{CacheError, Result};
pub use external::{ExternalCache, InProcessExternalCache};
pub use key::CacheKey;
pub use memory::{EntryInfo, UsefulnessCache};
pub use persistent::PersistentCache;
pub use tiered::{CacheStats, CacheTier, TieredCache};
