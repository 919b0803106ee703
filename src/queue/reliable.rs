//! Durable circular log with out-of-order commit reconciliation.
//!
//! Appends reserve a contiguous range of slots under a short lock, write the
//! batch to the store without holding it, and then advance the commit
//! frontier over every leading batch that has finished. Readers only ever see
//! records up to the frontier, so a slow writer holds back later writers'
//! records but never exposes a gap that might still be filled.
//!
//! ```text
//!   inflight:  [0 ✓][1 ✓][2 ✗][3 ✗][4 ✓][5 ✓]
//!               └── popped ──┘
//!   frontier = 1 until slots 2 and 3 commit (or fail and are dropped)
//! ```

use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{BaseComponent, Component, ComponentError, ComponentEvents};
use crate::config::QueueConfig;
use crate::store::{LogStore, StoreError, Storage, META_CHECKPOINT, META_LAST_COMMITTED};
use crate::telemetry::counters;

use super::record::{CheckpointInfo, CommitInfo, Record, RecordInfo};
use super::waiter::AsyncWaiter;
use super::{Queue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogStatus {
    Created,
    Open,
    Closed,
}

/// In-memory log state. Never held across an await or store call.
struct LogState {
    status: LogStatus,
    last_index: RecordInfo,
    last_committed: RecordInfo,
    checkpoint: RecordInfo,
    inflight: VecDeque<CommitInfo>,
}

impl LogState {
    fn new(max: i64) -> Self {
        Self {
            status: LogStatus::Created,
            last_index: RecordInfo::invalid(max),
            last_committed: RecordInfo::invalid(max),
            checkpoint: RecordInfo::invalid(max),
            inflight: VecDeque::new(),
        }
    }

    fn length(&self) -> i64 {
        if !self.last_committed.is_valid() {
            return 0;
        }
        self.checkpoint.distance_to(&self.last_committed)
    }

    /// Reserved or committed slots that have not been purged yet.
    fn outstanding(&self) -> i64 {
        if !self.last_index.is_valid() {
            return 0;
        }
        self.checkpoint.distance_to(&self.last_index)
    }

    fn is_live(&self, info: &RecordInfo) -> bool {
        let distance = self.checkpoint.distance_to(info);
        distance >= 1 && distance <= self.length()
    }

    /// First slot to read and the frontier to stop at, if anything is
    /// readable after `cursor`.
    fn readable_range(&self, cursor: RecordInfo, inclusive: bool) -> Option<(RecordInfo, RecordInfo)> {
        if self.length() == 0 {
            return None;
        }
        let start = if !cursor.is_valid() {
            self.checkpoint.next()
        } else if inclusive {
            cursor
        } else {
            cursor.next()
        };
        self.is_live(&start).then_some((start, self.last_committed))
    }

    /// Pop every committed batch at the head of the inflight queue.
    fn reconcile(&mut self) -> bool {
        let mut advanced = false;
        while self.inflight.front().is_some_and(|c| c.is_committed) {
            if let Some(commit) = self.inflight.pop_front() {
                self.last_committed = commit.record_info;
                advanced = true;
            }
        }
        advanced
    }
}

/// Durable, ordered, circular append log.
pub struct ReliableLog<T> {
    base: BaseComponent,
    config: QueueConfig,
    max: i64,
    store: Arc<dyn LogStore>,
    state: Mutex<LogState>,
    /// Serializes metadata writes so persisted values never regress.
    meta_lock: tokio::sync::Mutex<()>,
    waiter: AsyncWaiter,
    _items: PhantomData<fn() -> T>,
}

impl<T> ReliableLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a log backed by the tables `storage` keeps for `config.name`.
    pub fn new(config: QueueConfig, storage: &dyn Storage) -> Result<Self, QueueError> {
        let store = storage.open_log(&config.name)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: QueueConfig, store: Arc<dyn LogStore>) -> Self {
        let max = config.max_queue_length;
        Self {
            base: BaseComponent::new(config.name.clone()),
            config,
            max,
            store,
            state: Mutex::new(LogState::new(max)),
            meta_lock: tokio::sync::Mutex::new(()),
            waiter: AsyncWaiter::new(),
            _items: PhantomData,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn last_index(&self) -> RecordInfo {
        self.lock().last_index
    }

    pub fn last_committed_index(&self) -> RecordInfo {
        self.lock().last_committed
    }

    pub fn checkpoint_index(&self) -> RecordInfo {
        self.lock().checkpoint
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_info(&self, index: i64) -> RecordInfo {
        RecordInfo::new(index, self.max)
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    fn load_meta(&self, key: &str) -> Result<RecordInfo, QueueError> {
        match self.store.get_meta(key)? {
            Some(index) if (0..self.max).contains(&index) => Ok(self.to_info(index)),
            Some(index) => {
                warn!(
                    queue = %self.config.name,
                    key,
                    index,
                    max = self.max,
                    "persisted index outside ring, ignoring"
                );
                Ok(RecordInfo::invalid(self.max))
            }
            None => Ok(RecordInfo::invalid(self.max)),
        }
    }

    /// Restore the checkpoint and frontier, then make visible any record that
    /// reached the store before its frontier update did.
    fn recover(&self) -> Result<(), QueueError> {
        let checkpoint = self.load_meta(META_CHECKPOINT)?;
        let mut committed = self.load_meta(META_LAST_COMMITTED)?;
        if !committed.is_valid() && checkpoint.is_valid() {
            committed = checkpoint;
        }

        let live = if committed.is_valid() {
            checkpoint.distance_to(&committed)
        } else {
            0
        };

        let mut furthest = live;
        for index in self.store.record_indices()? {
            if !(0..self.max).contains(&index) {
                warn!(queue = %self.config.name, index, "record outside ring, ignoring");
                continue;
            }
            let info = self.to_info(index);
            let distance = checkpoint.distance_to(&info);
            if distance == 0 {
                warn!(queue = %self.config.name, index, "removing stale record at checkpoint slot");
                self.store.remove_record(index)?;
                continue;
            }
            furthest = furthest.max(distance);
        }

        let recovered = furthest - live;
        if recovered > 0 {
            let mut frontier = checkpoint;
            for _ in 0..furthest {
                frontier = frontier.next();
            }
            committed = frontier;
            self.store.set_meta(META_LAST_COMMITTED, committed.index)?;
            counters::records_recovered(&self.config.name, recovered as u64);
            warn!(
                queue = %self.config.name,
                recovered,
                frontier = committed.index,
                "recovered records committed past the persisted frontier"
            );
        }

        let mut state = self.lock();
        state.checkpoint = checkpoint;
        state.last_committed = committed;
        state.last_index = committed;
        state.inflight.clear();
        state.status = LogStatus::Open;
        let length = state.length();
        drop(state);

        self.waiter.reopen();
        counters::queue_length(&self.config.name, length);
        info!(
            queue = %self.config.name,
            checkpoint = checkpoint.index,
            last_committed = committed.index,
            length,
            "log recovered"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    fn encode(reserved: &[RecordInfo], items: Vec<T>) -> Result<Vec<(i64, Vec<u8>)>, QueueError> {
        reserved
            .iter()
            .zip(items)
            .map(|(info, item)| Ok((info.index, serde_json::to_vec(&item)?)))
            .collect()
    }

    fn write_batch(
        &self,
        reserved: &[RecordInfo],
        items: Vec<T>,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let encoded = Self::encode(reserved, items)?;
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        match self.store.insert_records(encoded) {
            Ok(()) => Ok(()),
            Err(StoreError::Occupied { index }) => Err(QueueError::QueueSizeExceeded { index }),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_frontier(&self) {
        let _guard = self.meta_lock.lock().await;
        let frontier = self.lock().last_committed;
        if let Err(e) = self.store.set_meta(META_LAST_COMMITTED, frontier.index) {
            error!(queue = %self.config.name, error = %e, "failed to persist commit frontier");
        }
    }

    /// Reserve, write and commit one batch. Errors are returned as they are.
    async fn append_batch(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        let count = items.len() as i64;

        let (reserved, previous_last) = {
            let mut state = self.lock();
            if state.status != LogStatus::Open {
                return Err(QueueError::Closed);
            }
            if state.outstanding() + count > self.max - 1 {
                return Err(QueueError::QueueSizeExceeded {
                    index: state.last_index.next().index,
                });
            }

            let previous_last = state.last_index;
            let mut reserved = Vec::with_capacity(items.len());
            let mut slot = state.last_index;
            for _ in 0..count {
                slot = slot.next();
                state.inflight.push_back(CommitInfo::pending(slot));
                reserved.push(slot);
            }
            state.last_index = slot;
            (reserved, previous_last)
        };

        let result = self.write_batch(&reserved, items, cancel);

        let advanced = {
            let mut state = self.lock();
            let batch: HashSet<i64> = reserved.iter().map(|r| r.index).collect();
            match &result {
                Ok(()) => {
                    for commit in state.inflight.iter_mut() {
                        if batch.contains(&commit.record_info.index) {
                            commit.is_committed = true;
                        }
                    }
                }
                Err(_) => {
                    state.inflight.retain(|c| !batch.contains(&c.record_info.index));
                    if reserved.last() == Some(&state.last_index) {
                        state.last_index = previous_last;
                    }
                }
            }
            state.reconcile()
        };

        if advanced {
            self.persist_frontier().await;
            self.waiter.signal();
            counters::queue_length(&self.config.name, self.length());
        }

        result?;
        counters::queue_appended(&self.config.name, count as u64);
        debug!(first = reserved[0].index, "batch committed");
        Ok(())
    }

    fn surface(&self, error: QueueError) -> Result<(), QueueError> {
        counters::queue_append_failed(&self.config.name, append_failure_reason(&error));
        if self.config.strict_append || matches!(error, QueueError::Closed) {
            return Err(error);
        }
        warn!(queue = %self.config.name, error = %error, "append failed");
        Ok(())
    }
}

fn append_failure_reason(error: &QueueError) -> &'static str {
    match error {
        QueueError::QueueSizeExceeded { .. } => "queue_full",
        QueueError::Closed => "closed",
        QueueError::Cancelled => "cancelled",
        QueueError::Store(_) => "store",
        QueueError::Serialization(_) => "serialization",
    }
}

#[async_trait]
impl<T> Queue<T> for ReliableLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn max_queue_length(&self) -> i64 {
        self.max
    }

    #[instrument(skip_all, fields(queue = %self.config.name, count = items.len()))]
    async fn append(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError> {
        match self.append_batch(items, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => self.surface(e),
        }
    }

    #[instrument(skip_all, fields(queue = %self.config.name, count = items.len()))]
    async fn try_append(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError> {
        let result = self.append_batch(items, cancel).await;
        if let Err(e) = &result {
            counters::queue_append_failed(&self.config.name, append_failure_reason(e));
        }
        result
    }


    async fn read(
        &self,
        cursor: RecordInfo,
        count: usize,
        inclusive: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record<T>>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut handle = self.waiter.subscribe();

        let (start, frontier) = loop {
            {
                let state = self.lock();
                if state.status != LogStatus::Open {
                    return Ok(Vec::new());
                }
                if let Some(range) = state.readable_range(cursor, inclusive) {
                    break range;
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                woke = handle.wait() => {
                    if !woke {
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let mut records = Vec::with_capacity(count.min(self.max as usize));
        let mut slot = start;
        for _ in 0..self.max {
            if let Some(bytes) = self.store.get_record(slot.index)? {
                match serde_json::from_slice::<T>(&bytes) {
                    Ok(item) => records.push(Record::new(item, slot)),
                    Err(e) => {
                        counters::record_decode_failed(&self.config.name);
                        error!(queue = %self.config.name, index = slot.index, error = %e, "skipping undecodable record");
                    }
                }
            }
            if records.len() >= count || slot == frontier {
                break;
            }
            slot = slot.next();
        }

        Ok(records)
    }

    #[instrument(skip_all, fields(queue = %self.config.name, first = info.first_record_info.index, last = info.last_record_info.index))]
    async fn checkpoint(&self, info: CheckpointInfo) -> Result<(), QueueError> {
        let first = info.first_record_info;
        let last = info.last_record_info;

        let current = {
            let state = self.lock();
            if state.status != LogStatus::Open {
                return Err(QueueError::Closed);
            }
            if last == state.checkpoint {
                warn!(
                    checkpoint = state.checkpoint.index,
                    "range already checkpointed, ignoring"
                );
                counters::checkpoint_mismatch(&self.config.name);
                return Ok(());
            }
            if !state.is_live(&last) {
                warn!(
                    checkpoint = state.checkpoint.index,
                    last_committed = state.last_committed.index,
                    "checkpoint outside the live range, ignoring"
                );
                counters::checkpoint_mismatch(&self.config.name);
                return Ok(());
            }
            state.checkpoint
        };

        // Everything up to `last` leaves the live range, so purge from the
        // oldest record even when the caller's range starts later.
        let oldest = current.next();
        let skipped = if first == oldest {
            0
        } else {
            let skipped = if current.distance_to(&first) <= current.distance_to(&last) {
                current.distance_to(&first) - 1
            } else {
                0
            };
            warn!(
                expected_first = oldest.index,
                first = first.index,
                skipped,
                "checkpoint does not start at the oldest record, purging from the oldest"
            );
            counters::checkpoint_mismatch(&self.config.name);
            skipped
        };

        let span = current.distance_to(&last);
        let mut removed = 0usize;
        let mut slot = oldest;
        for step in 0..span {
            if self.store.remove_record(slot.index)? && step >= skipped {
                removed += 1;
            }
            slot = slot.next();
        }

        if removed != info.record_count {
            warn!(
                expected = info.record_count,
                removed,
                "checkpoint removed a different number of records than reported"
            );
            counters::checkpoint_mismatch(&self.config.name);
        }

        let length = {
            let mut state = self.lock();
            if state.is_live(&last) {
                state.checkpoint = last;
            }
            state.length()
        };

        {
            let _guard = self.meta_lock.lock().await;
            let checkpoint = self.lock().checkpoint;
            self.store.set_meta(META_CHECKPOINT, checkpoint.index)?;
        }

        counters::queue_length(&self.config.name, length);
        debug!(removed, length, "checkpoint applied");
        Ok(())
    }

    fn length(&self) -> i64 {
        self.lock().length()
    }
}

#[async_trait]
impl<T> Component for ReliableLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.base.name()
    }

    fn events(&self) -> &ComponentEvents {
        self.base.events()
    }

    async fn open(&self, _cancel: &CancellationToken) -> Result<(), ComponentError> {
        self.base
            .open(|| Ok(()), async { self.recover().map_err(anyhow::Error::from) })
            .await
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<(), ComponentError> {
        self.base
            .close(
                || {
                    self.lock().status = LogStatus::Closed;
                    self.waiter.close();
                    Ok(())
                },
                async { Ok(()) },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLogStore, MemoryStorage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    fn config(max: i64) -> QueueConfig {
        QueueConfig::new("test", max)
    }

    async fn open_log(max: i64) -> ReliableLog<String> {
        let log = ReliableLog::with_store(config(max), Arc::new(MemoryLogStore::new("test")));
        log.open(&CancellationToken::new()).await.unwrap();
        log
    }

    fn items(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    async fn read_all(log: &ReliableLog<String>, cursor: RecordInfo) -> Vec<Record<String>> {
        log.read(cursor, 1000, false, Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Store wrapper that can fail or stall inserts and records metadata writes.
    struct ControlledStore {
        inner: MemoryLogStore,
        fail_next: AtomicBool,
        stall_next: AtomicBool,
        fail_stalled: AtomicBool,
        meta_writes: StdMutex<Vec<(String, i64)>>,
    }

    impl ControlledStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryLogStore::new("controlled"),
                fail_next: AtomicBool::new(false),
                stall_next: AtomicBool::new(false),
                fail_stalled: AtomicBool::new(false),
                meta_writes: StdMutex::new(Vec::new()),
            })
        }
    }

    impl LogStore for ControlledStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn insert_records(&self, records: Vec<(i64, Vec<u8>)>) -> Result<(), StoreError> {
            if self.stall_next.swap(false, Ordering::SeqCst) {
                let fail = self.fail_stalled.swap(false, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                if fail {
                    return Err(StoreError::Unavailable("injected".into()));
                }
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.insert_records(records)
        }

        fn get_record(&self, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_record(index)
        }

        fn remove_record(&self, index: i64) -> Result<bool, StoreError> {
            self.inner.remove_record(index)
        }

        fn record_indices(&self) -> Result<Vec<i64>, StoreError> {
            self.inner.record_indices()
        }

        fn get_meta(&self, key: &str) -> Result<Option<i64>, StoreError> {
            self.inner.get_meta(key)
        }

        fn set_meta(&self, key: &str, value: i64) -> Result<(), StoreError> {
            self.meta_writes.lock().unwrap().push((key.to_string(), value));
            self.inner.set_meta(key, value)
        }
    }

    #[tokio::test]
    async fn test_append_then_read_in_order() {
        let log = open_log(16).await;
        let cancel = CancellationToken::new();

        log.append(items("a", 3), &cancel).await.unwrap();
        log.append(items("b", 2), &cancel).await.unwrap();

        let records = read_all(&log, log.start_cursor()).await;
        let values: Vec<_> = records.iter().map(|r| r.item.as_str()).collect();
        assert_eq!(values, vec!["a0", "a1", "a2", "b0", "b1"]);
        let indices: Vec<_> = records.iter().map(|r| r.record_info.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(log.length(), 5);
    }

    #[tokio::test]
    async fn test_read_respects_count_and_cursor() {
        let log = open_log(16).await;
        let cancel = CancellationToken::new();
        log.append(items("x", 6), &cancel).await.unwrap();

        let first = log
            .read(log.start_cursor(), 2, false, Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let cursor = first.last().unwrap().record_info;
        let next = log.read(cursor, 2, false, Duration::ZERO, &cancel).await.unwrap();
        assert_eq!(next[0].item, "x2");

        let again = log.read(cursor, 1, true, Duration::ZERO, &cancel).await.unwrap();
        assert_eq!(again[0].item, "x1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_empty() {
        let log = open_log(8).await;
        let records = log
            .read(log.start_cursor(), 10, false, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let log = Arc::new(open_log(8).await);
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(items("late", 1), &CancellationToken::new()).await.unwrap();
        });

        let records = log
            .read(log.start_cursor(), 10, false, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item, "late0");
    }

    #[tokio::test]
    async fn test_cancelled_read_returns_empty() {
        let log = open_log(8).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let records = log
            .read(log.start_cursor(), 10, false, Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_blocked_reader() {
        let log = Arc::new(open_log(8).await);
        let reader = log.clone();
        let task = tokio::spawn(async move {
            reader
                .read(reader.start_cursor(), 10, false, Duration::from_secs(60), &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.close(&CancellationToken::new()).await.unwrap();

        let records = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(records.is_empty());

        let err = log.append(items("z", 1), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_capacity_is_one_less_than_ring() {
        let log = ReliableLog::with_store(
            config(5).with_strict_append(true),
            Arc::new(MemoryLogStore::new("test")),
        );
        log.open(&CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(items("a", 4), &cancel).await.unwrap();
        let err = log.append(items("b", 1), &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueSizeExceeded { index: 4 }));
        assert_eq!(log.length(), 4);
    }

    #[tokio::test]
    async fn test_lenient_append_swallows_full_queue() {
        let log = open_log(3).await;
        let cancel = CancellationToken::new();

        log.append(items("a", 2), &cancel).await.unwrap();
        log.append(items("b", 1), &cancel).await.unwrap();

        assert_eq!(log.length(), 2);
        assert_eq!(log.last_index().index, 1);
    }

    #[tokio::test]
    async fn test_try_append_returns_full_queue_on_lenient_log() {
        let log = open_log(3).await;
        let cancel = CancellationToken::new();
        log.append(items("a", 2), &cancel).await.unwrap();

        let err = log.try_append(items("b", 1), &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueSizeExceeded { index: 2 }));
        assert_eq!(log.length(), 2);
        assert_eq!(log.last_index().index, 1);
    }

    #[tokio::test]
    async fn test_wraparound_keeps_order() {
        let log = open_log(4).await;
        let cancel = CancellationToken::new();
        let mut cursor = log.start_cursor();
        let mut seen_indices = Vec::new();

        for round in 0..10 {
            log.append(items(&format!("r{round}-"), 2), &cancel).await.unwrap();
            let records = log.read(cursor, 10, false, Duration::ZERO, &cancel).await.unwrap();
            assert_eq!(records.len(), 2, "round {round}");
            assert_eq!(records[0].item, format!("r{round}-0"));
            assert_eq!(records[1].item, format!("r{round}-1"));
            seen_indices.extend(records.iter().map(|r| r.record_info.index));

            let cp = CheckpointInfo::for_records(&records).unwrap();
            log.checkpoint(cp).await.unwrap();
            cursor = cp.last_record_info;
            assert_eq!(log.length(), 0);
        }

        assert_eq!(&seen_indices[..8], &[0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_length_across_wrap() {
        let log = open_log(5).await;
        let cancel = CancellationToken::new();

        log.append(items("a", 4), &cancel).await.unwrap();
        let records = read_all(&log, log.start_cursor()).await;
        log.checkpoint(CheckpointInfo::for_records(&records[..3]).unwrap())
            .await
            .unwrap();
        assert_eq!(log.length(), 1);

        log.append(items("b", 3), &cancel).await.unwrap();
        assert_eq!(log.last_committed_index().index, 1);
        assert_eq!(log.checkpoint_index().index, 2);
        assert_eq!(log.length(), 4);
    }

    #[tokio::test]
    async fn test_checkpoint_is_idempotent() {
        let log = open_log(8).await;
        let cancel = CancellationToken::new();
        log.append(items("a", 4), &cancel).await.unwrap();

        let records = read_all(&log, log.start_cursor()).await;
        let cp = CheckpointInfo::for_records(&records[..2]).unwrap();
        log.checkpoint(cp).await.unwrap();
        assert_eq!(log.length(), 2);

        log.checkpoint(cp).await.unwrap();
        assert_eq!(log.length(), 2);
        assert_eq!(log.checkpoint_index().index, 1);

        let rest = read_all(&log, log.start_cursor()).await;
        assert_eq!(rest[0].item, "a2");
    }

    #[tokio::test]
    async fn test_repeated_checkpoint_writes_nothing() {
        let store = ControlledStore::new();
        let log = ReliableLog::<String>::with_store(config(8), store.clone());
        let cancel = CancellationToken::new();
        log.open(&cancel).await.unwrap();
        log.append(items("a", 3), &cancel).await.unwrap();

        let records = read_all(&log, log.start_cursor()).await;
        let cp = CheckpointInfo::for_records(&records[..2]).unwrap();
        log.checkpoint(cp).await.unwrap();
        let writes = store.meta_writes.lock().unwrap().len();

        log.checkpoint(cp).await.unwrap();
        assert_eq!(store.meta_writes.lock().unwrap().len(), writes);
        assert_eq!(log.checkpoint_index().index, 1);
        assert_eq!(log.length(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_skipping_prefix_purges_it() {
        let store = Arc::new(MemoryLogStore::new("test"));
        let log = ReliableLog::<String>::with_store(config(8), store.clone());
        let cancel = CancellationToken::new();
        log.open(&cancel).await.unwrap();

        log.append(items("a", 4), &cancel).await.unwrap();
        // caller only reports slots 2..=3; slots 0 and 1 must go too
        let partial = CheckpointInfo::new(RecordInfo::new(2, 8), RecordInfo::new(3, 8), 2);
        log.checkpoint(partial).await.unwrap();
        assert_eq!(log.length(), 0);
        assert_eq!(store.record_count(), 0);

        log.append(items("b", 4), &cancel).await.unwrap();
        let records = read_all(&log, log.start_cursor()).await;
        log.checkpoint(CheckpointInfo::for_records(&records).unwrap())
            .await
            .unwrap();

        // the ring wraps onto the slots of the skipped prefix
        log.try_append(items("c", 2), &cancel).await.unwrap();
        let records = read_all(&log, log.start_cursor()).await;
        let values: Vec<_> = records.iter().map(|r| r.item.as_str()).collect();
        assert_eq!(values, vec!["c0", "c1"]);
        assert_eq!(records[0].record_info.index, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_beyond_frontier_is_ignored() {
        let log = open_log(8).await;
        let cancel = CancellationToken::new();
        log.append(items("a", 2), &cancel).await.unwrap();

        let bogus = CheckpointInfo::new(RecordInfo::new(0, 8), RecordInfo::new(5, 8), 6);
        log.checkpoint(bogus).await.unwrap();

        assert!(!log.checkpoint_index().is_valid());
        assert_eq!(log.length(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_frontier_is_monotonic() {
        let store = ControlledStore::new();
        let log = Arc::new(ReliableLog::<String>::with_store(config(1024), store.clone()));
        log.open(&CancellationToken::new()).await.unwrap();

        let mut tasks = Vec::new();
        for t in 0..20 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.append(items(&format!("t{t}-"), 5), &CancellationToken::new())
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(log.length(), 100);
        assert_eq!(log.last_committed_index().index, 99);

        let frontier_writes: Vec<i64> = store
            .meta_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == META_LAST_COMMITTED)
            .map(|(_, v)| *v)
            .collect();
        assert!(frontier_writes.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(frontier_writes.last(), Some(&99));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_out_of_order_commit_waits_for_earlier_batch() {
        let store = ControlledStore::new();
        let log = Arc::new(ReliableLog::<String>::with_store(config(16), store.clone()));
        log.open(&CancellationToken::new()).await.unwrap();

        store.stall_next.store(true, Ordering::SeqCst);
        let slow = {
            let log = log.clone();
            tokio::spawn(async move { log.append(items("slow", 2), &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        log.append(items("fast", 2), &CancellationToken::new()).await.unwrap();
        assert_eq!(log.length(), 0, "fast batch must wait for the earlier reservation");
        assert!(!log.last_committed_index().is_valid());

        slow.await.unwrap().unwrap();
        assert_eq!(log.length(), 4);

        let values: Vec<_> = read_all(&log, log.start_cursor())
            .await
            .into_iter()
            .map(|r| r.item)
            .collect();
        assert_eq!(values, vec!["slow0", "slow1", "fast0", "fast1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_batch_leaves_hole_that_readers_skip() {
        let store = ControlledStore::new();
        let log = Arc::new(ReliableLog::<String>::with_store(config(16), store.clone()));
        log.open(&CancellationToken::new()).await.unwrap();

        store.fail_stalled.store(true, Ordering::SeqCst);
        store.stall_next.store(true, Ordering::SeqCst);
        let doomed = {
            let log = log.clone();
            tokio::spawn(async move { log.append(items("doomed", 2), &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.append(items("ok", 2), &CancellationToken::new()).await.unwrap();

        // lenient mode swallows the failure
        doomed.await.unwrap().unwrap();

        let records = read_all(&log, log.start_cursor()).await;
        let indices: Vec<_> = records.iter().map(|r| r.record_info.index).collect();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(log.last_committed_index().index, 3);
    }

    #[tokio::test]
    async fn test_failed_tail_batch_is_rolled_back() {
        let store = ControlledStore::new();
        let log = ReliableLog::<String>::with_store(config(16).with_strict_append(true), store.clone());
        log.open(&CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();

        log.append(items("a", 2), &cancel).await.unwrap();
        store.fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(
            log.append(items("b", 2), &cancel).await,
            Err(QueueError::Store(_))
        ));
        log.append(items("c", 1), &cancel).await.unwrap();

        let indices: Vec<_> = read_all(&log, log.start_cursor())
            .await
            .iter()
            .map(|r| r.record_info.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_append_fails() {
        let log = ReliableLog::<String>::with_store(
            config(8).with_strict_append(true),
            Arc::new(MemoryLogStore::new("test")),
        );
        log.open(&CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = log.append(items("a", 1), &cancel).await.unwrap_err();
        assert!(matches!(err, QueueError::Cancelled));
        assert_eq!(log.length(), 0);
    }

    #[tokio::test]
    async fn test_reopen_recovers_checkpoint_and_frontier() {
        let storage = MemoryStorage::new();
        let cancel = CancellationToken::new();

        {
            let log = ReliableLog::<String>::new(config(8), &storage).unwrap();
            log.open(&cancel).await.unwrap();
            log.append(items("a", 4), &cancel).await.unwrap();
            let records = read_all(&log, log.start_cursor()).await;
            log.checkpoint(CheckpointInfo::for_records(&records[..2]).unwrap())
                .await
                .unwrap();
            log.close(&cancel).await.unwrap();
        }

        let log = ReliableLog::<String>::new(config(8), &storage).unwrap();
        log.open(&cancel).await.unwrap();
        assert_eq!(log.length(), 2);
        let records = read_all(&log, log.start_cursor()).await;
        assert_eq!(records[0].item, "a2");
        assert_eq!(records[0].record_info.index, 2);
    }

    #[tokio::test]
    async fn test_recovery_exposes_records_past_persisted_frontier() {
        let storage = MemoryStorage::new();
        let cancel = CancellationToken::new();

        {
            let log = ReliableLog::<String>::new(config(8), &storage).unwrap();
            log.open(&cancel).await.unwrap();
            log.append(items("a", 3), &cancel).await.unwrap();
        }

        // simulate a crash between the record write and the frontier update
        storage
            .open_log("test")
            .unwrap()
            .set_meta(META_LAST_COMMITTED, 0)
            .unwrap();

        let log = ReliableLog::<String>::new(config(8), &storage).unwrap();
        log.open(&cancel).await.unwrap();
        assert_eq!(log.length(), 3);
        assert_eq!(log.last_committed_index().index, 2);
    }
}
