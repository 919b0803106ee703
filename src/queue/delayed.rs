//! Delivery-time gate over a log of output messages.
//!
//! Records become visible only once their `delivery_time` has passed. A read
//! that pulled records from the inner log which are not yet due keeps them in
//! a one-slot buffer, keyed by the cursor the next read is expected to use,
//! so the inner log is not re-read while waiting.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::OutputMessage;

use super::record::{CheckpointInfo, Record, RecordInfo};
use super::{Queue, QueueError};

struct ReadBuffer {
    start_cursor: RecordInfo,
    records: Vec<Record<OutputMessage>>,
}

/// A [`Queue`] that withholds records until they are due.
pub struct DelayedReliableLog {
    inner: Arc<dyn Queue<OutputMessage>>,
    buffer: Mutex<Option<ReadBuffer>>,
}

impl DelayedReliableLog {
    pub fn new(inner: Arc<dyn Queue<OutputMessage>>) -> Self {
        Self {
            inner,
            buffer: Mutex::new(None),
        }
    }

    /// Number of records held back from the last read.
    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |b| b.records.len())
    }

    fn take_buffer(&self, cursor: RecordInfo, inclusive: bool) -> Option<Vec<Record<OutputMessage>>> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        match buffer.take() {
            Some(b) if !inclusive && b.start_cursor == cursor && !b.records.is_empty() => Some(b.records),
            Some(b) => {
                debug!(
                    queue = %self.inner.name(),
                    discarded = b.records.len(),
                    "cursor moved, discarding buffered records"
                );
                None
            }
            None => None,
        }
    }

    fn stash(&self, start_cursor: RecordInfo, records: Vec<Record<OutputMessage>>) {
        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(ReadBuffer {
            start_cursor,
            records,
        });
    }

    /// Keep records that were not returned, if a later non-inclusive read
    /// from `cursor` would see them next.
    fn hold_back(&self, cursor: RecordInfo, inclusive: bool, records: Vec<Record<OutputMessage>>) {
        if !inclusive && !records.is_empty() {
            self.stash(cursor, records);
        }
    }
}

/// Wall-clock time `started.elapsed()` after `observed`, never behind
/// `Utc::now()`. Follows the runtime clock when tokio time is paused.
fn elapsed_since(observed: DateTime<Utc>, started: tokio::time::Instant) -> DateTime<Utc> {
    let advanced = chrono::Duration::from_std(started.elapsed())
        .ok()
        .and_then(|d| observed.checked_add_signed(d))
        .unwrap_or(observed);
    advanced.max(Utc::now())
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[async_trait]
impl Queue<OutputMessage> for DelayedReliableLog {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn max_queue_length(&self) -> i64 {
        self.inner.max_queue_length()
    }

    async fn append(&self, items: Vec<OutputMessage>, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.inner.append(items, cancel).await
    }

    async fn try_append(&self, items: Vec<OutputMessage>, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.inner.try_append(items, cancel).await
    }

    async fn read(
        &self,
        cursor: RecordInfo,
        count: usize,
        inclusive: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record<OutputMessage>>, QueueError> {
        let records = match self.take_buffer(cursor, inclusive) {
            Some(records) => records,
            None => self.inner.read(cursor, count, inclusive, timeout, cancel).await?,
        };
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };

        let observed = Utc::now();
        let started = tokio::time::Instant::now();
        let wait = (first.item.delivery_time - observed)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            if wait > timeout {
                sleep_cancellable(timeout, cancel).await;
                self.hold_back(cursor, inclusive, records);
                return Ok(Vec::new());
            }
            if !sleep_cancellable(wait, cancel).await {
                self.hold_back(cursor, inclusive, records);
                return Ok(Vec::new());
            }
        }

        let now = elapsed_since(observed, started);
        let due = records
            .iter()
            .position(|r| r.item.delivery_time > now)
            .unwrap_or(records.len())
            .min(count);

        let mut ready = records;
        let pending = ready.split_off(due);

        match ready.last() {
            Some(last) => {
                let resume = last.record_info;
                if !pending.is_empty() {
                    debug!(queue = %self.inner.name(), ready = ready.len(), pending = pending.len(), "holding back records not yet due");
                    self.stash(resume, pending);
                }
            }
            None => self.hold_back(cursor, inclusive, pending),
        }

        Ok(ready)
    }

    async fn checkpoint(&self, info: CheckpointInfo) -> Result<(), QueueError> {
        self.inner.checkpoint(info).await
    }

    fn length(&self) -> i64 {
        self.inner.length()
    }
}
