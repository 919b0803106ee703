//! Persisted key-value storage behind every log.
//!
//! Each log owns one [`LogStore`]: a record table keyed by ring index and a
//! small metadata table holding the commit frontier and the checkpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Storage                            │
//! │   open_log("instant")   open_log("delayed-0")   ...         │
//! │  ┌──────────────────┐  ┌──────────────────┐                 │
//! │  │ records │  meta  │  │ records │  meta  │                 │
//! │  └──────────────────┘  └──────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//!                │
//!        ┌───────┴────────┐
//!        ▼                ▼
//!   ┌──────────┐     ┌──────────┐
//!   │  Memory  │     │  Fjall   │
//!   │  (dev)   │     │ (prod)   │
//!   └──────────┘     └──────────┘
//! ```
//!
//! # Implementations
//!
//! - [`MemoryStorage`]: In-memory, volatile - for development/testing
//! - [`PersistentStorage`]: Fjall-backed, durable - for production

mod factory;
mod memory;
mod persistent;

pub use factory::create_storage;
pub use memory::{MemoryLogStore, MemoryStorage};
pub use persistent::PersistentStorage;

use std::sync::Arc;

/// Metadata key holding the last committed ring index.
pub const META_LAST_COMMITTED: &str = "last_committed_index";

/// Metadata key holding the last purged ring index.
pub const META_CHECKPOINT: &str = "checkpoint_index";

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("slot {index} is still occupied")]
    Occupied { index: i64 },

    #[error("storage backend error: {0}")]
    Backend(#[from] fjall::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Factory for per-log stores.
pub trait Storage: Send + Sync {
    /// Open (or create) the tables backing the log called `name`.
    fn open_log(&self, name: &str) -> Result<Arc<dyn LogStore>, StoreError>;

    /// Force pending writes to durable media.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

/// Record and metadata tables of a single log.
///
/// All implementations must be thread-safe (Send + Sync).
pub trait LogStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert every record or none of them.
    ///
    /// Fails with [`StoreError::Occupied`] if any index already holds a
    /// record; nothing is written in that case.
    fn insert_records(&self, records: Vec<(i64, Vec<u8>)>) -> Result<(), StoreError>;

    fn get_record(&self, index: i64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a record. Returns whether it existed.
    fn remove_record(&self, index: i64) -> Result<bool, StoreError>;

    /// Every index currently holding a record, ascending.
    fn record_indices(&self) -> Result<Vec<i64>, StoreError>;

    fn get_meta(&self, key: &str) -> Result<Option<i64>, StoreError>;

    fn set_meta(&self, key: &str, value: i64) -> Result<(), StoreError>;
}
