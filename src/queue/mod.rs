//! Durable circular logs.
//!
//! - [`ReliableLog`]: persisted ring buffer with out-of-order commit
//!   reconciliation and consumer checkpoints.
//! - [`DelayedReliableLog`]: hides records until their delivery time,
//!   turning a log into a retry tier.
//!
//! Both implement [`Queue`], which is what processors consume.

mod delayed;
mod record;
mod reliable;
mod waiter;

pub use delayed::DelayedReliableLog;
pub use record::{CheckpointInfo, CommitInfo, Record, RecordInfo};
pub use reliable::ReliableLog;
pub use waiter::{AsyncWaiter, WaitHandle};

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::store::StoreError;

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full at slot {index}")]
    QueueSizeExceeded { index: i64 },

    #[error("queue is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append/read/checkpoint surface shared by every log flavour.
#[async_trait]
pub trait Queue<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Capacity of the ring, used to build cursors.
    fn max_queue_length(&self) -> i64;

    /// Durably append a batch. All items commit together or not at all.
    async fn append(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError>;

    /// Like [`Queue::append`], but every failure is returned regardless of
    /// the log's `strict_append` setting.
    async fn try_append(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError>;

    /// Read up to `count` committed records after `cursor`.
    ///
    /// Waits up to `timeout` for data. Timeout, cancellation and close all
    /// yield an empty batch.
    async fn read(
        &self,
        cursor: RecordInfo,
        count: usize,
        inclusive: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record<T>>, QueueError>;

    /// Release a consumed range.
    async fn checkpoint(&self, info: CheckpointInfo) -> Result<(), QueueError>;

    /// Committed, not yet checkpointed records.
    fn length(&self) -> i64;

    /// Cursor positioned before the oldest record.
    fn start_cursor(&self) -> RecordInfo {
        RecordInfo::invalid(self.max_queue_length())
    }
}
