//! In-memory storage implementation.
//!
//! Volatile storage for development and testing. All data is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::{LogStore, StoreError, Storage};

// =============================================================================
// MemoryStorage
// =============================================================================

/// In-memory storage implementation.
///
/// Opening the same log name twice returns the same tables, so a log can be
/// closed and reopened within one process to exercise recovery.
#[derive(Default)]
pub struct MemoryStorage {
    logs: RwLock<HashMap<String, Arc<MemoryLogStore>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logs opened so far.
    pub fn log_count(&self) -> usize {
        self.logs.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Storage for MemoryStorage {
    fn open_log(&self, name: &str) -> Result<Arc<dyn LogStore>, StoreError> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        let log = logs
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(log = %name, "creating in-memory log tables");
                Arc::new(MemoryLogStore::new(name))
            })
            .clone();
        Ok(log)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// MemoryLogStore
// =============================================================================

#[derive(Default)]
struct Tables {
    records: BTreeMap<i64, Vec<u8>>,
    meta: HashMap<String, i64>,
}

/// Tables of one in-memory log.
pub struct MemoryLogStore {
    name: String,
    tables: RwLock<Tables>,
}

impl MemoryLogStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> usize {
        self.read().records.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStore for MemoryLogStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_records(&self, records: Vec<(i64, Vec<u8>)>) -> Result<(), StoreError> {
        let mut tables = self.write();
        if let Some((index, _)) = records
            .iter()
            .find(|(index, _)| tables.records.contains_key(index))
        {
            return Err(StoreError::Occupied { index: *index });
        }
        tables.records.extend(records);
        Ok(())
    }

    fn get_record(&self, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read().records.get(&index).cloned())
    }

    fn remove_record(&self, index: i64) -> Result<bool, StoreError> {
        Ok(self.write().records.remove(&index).is_some())
    }

    fn record_indices(&self) -> Result<Vec<i64>, StoreError> {
        Ok(self.read().records.keys().copied().collect())
    }

    fn get_meta(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.read().meta.get(key).copied())
    }

    fn set_meta(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.write().meta.insert(key.to_string(), value);
        Ok(())
    }
}
