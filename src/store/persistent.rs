//! Persistent storage using fjall (pure Rust LSM-tree).
//!
//! Durable storage for production use. All data survives restarts.
//! Each log gets two partitions, `<log>_records` and `<log>_meta`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info, warn};

use super::{LogStore, StoreError, Storage};

// =============================================================================
// PersistentStorage
// =============================================================================

/// Persistent storage using a fjall keyspace shared by all logs.
pub struct PersistentStorage {
    keyspace: Keyspace,
    path: PathBuf,
    logs: RwLock<HashMap<String, Arc<PersistentLogStore>>>,
}

impl PersistentStorage {
    /// Open or create persistent storage at the given path.
    pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path).open()?;

        info!(
            path = %path.display(),
            partitions = keyspace.partition_count(),
            "persistent storage opened"
        );

        Ok(Arc::new(Self {
            keyspace,
            path: path.to_path_buf(),
            logs: RwLock::new(HashMap::new()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for PersistentStorage {
    fn open_log(&self, name: &str) -> Result<Arc<dyn LogStore>, StoreError> {
        if let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(log.clone());
        }

        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = logs.get(name) {
            return Ok(log.clone());
        }

        let records = self
            .keyspace
            .open_partition(&format!("{name}_records"), PartitionCreateOptions::default())?;
        let meta = self
            .keyspace
            .open_partition(&format!("{name}_meta"), PartitionCreateOptions::default())?;

        debug!(log = %name, "opened log partitions");

        let log = Arc::new(PersistentLogStore {
            name: name.to_string(),
            keyspace: self.keyspace.clone(),
            records,
            meta,
            write_lock: Mutex::new(()),
        });
        logs.insert(name.to_string(), log.clone());
        Ok(log)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

// =============================================================================
// PersistentLogStore
// =============================================================================

/// Record and metadata partitions of one log.
pub struct PersistentLogStore {
    name: String,
    keyspace: Keyspace,
    records: PartitionHandle,
    meta: PartitionHandle,
    /// Serializes the occupancy check with the batch commit.
    write_lock: Mutex<()>,
}

fn record_key(index: i64) -> Vec<u8> {
    (index as u64).to_be_bytes().to_vec()
}

fn decode_record_key(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes) as i64)
}

impl LogStore for PersistentLogStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_records(&self, records: Vec<(i64, Vec<u8>)>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        for (index, _) in &records {
            if self.records.contains_key(record_key(*index))? {
                return Err(StoreError::Occupied { index: *index });
            }
        }

        let mut batch = self.keyspace.batch();
        for (index, value) in records {
            batch.insert(&self.records, record_key(index), value);
        }
        batch.commit()?;
        Ok(())
    }

    fn get_record(&self, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(record_key(index))?.map(|v| v.to_vec()))
    }

    fn remove_record(&self, index: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = record_key(index);
        if !self.records.contains_key(&key)? {
            return Ok(false);
        }
        self.records.remove(key)?;
        Ok(true)
    }

    fn record_indices(&self) -> Result<Vec<i64>, StoreError> {
        let mut indices = Vec::new();
        for item in self.records.keys() {
            let key = item?;
            match decode_record_key(&key) {
                Some(index) => indices.push(index),
                None => warn!(log = %self.name, key_len = key.len(), "skipping malformed record key"),
            }
        }
        Ok(indices)
    }

    fn get_meta(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.meta.get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn set_meta(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&value)?;
        self.meta.insert(key.as_bytes(), value)?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (Arc<PersistentStorage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = PersistentStorage::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_insert_and_get_record() {
        let (storage, _temp) = create_test_store();
        let log = storage.open_log("instant").unwrap();

        log.insert_records(vec![(0, b"first".to_vec()), (1, b"second".to_vec())])
            .unwrap();

        assert_eq!(log.get_record(0).unwrap(), Some(b"first".to_vec()));
        assert_eq!(log.get_record(1).unwrap(), Some(b"second".to_vec()));
        assert!(log.get_record(2).unwrap().is_none());
    }

    #[test]
    fn test_occupied_rejects_whole_batch() {
        let (storage, _temp) = create_test_store();
        let log = storage.open_log("instant").unwrap();

        log.insert_records(vec![(3, b"taken".to_vec())]).unwrap();
        let err = log
            .insert_records(vec![(2, b"a".to_vec()), (3, b"b".to_vec())])
            .unwrap_err();

        assert!(matches!(err, StoreError::Occupied { index: 3 }));
        assert!(log.get_record(2).unwrap().is_none());
        assert_eq!(log.get_record(3).unwrap(), Some(b"taken".to_vec()));
    }

    #[test]
    fn test_remove_record() {
        let (storage, _temp) = create_test_store();
        let log = storage.open_log("instant").unwrap();

        log.insert_records(vec![(0, vec![1])]).unwrap();
        assert!(log.remove_record(0).unwrap());
        assert!(!log.remove_record(0).unwrap());
        assert!(log.record_indices().unwrap().is_empty());
    }

    #[test]
    fn test_logs_are_isolated() {
        let (storage, _temp) = create_test_store();
        let a = storage.open_log("a").unwrap();
        let b = storage.open_log("b").unwrap();

        a.insert_records(vec![(0, vec![1])]).unwrap();
        b.insert_records(vec![(0, vec![2])]).unwrap();
        a.set_meta("k", 1).unwrap();

        assert_eq!(b.get_record(0).unwrap(), Some(vec![2]));
        assert_eq!(b.get_meta("k").unwrap(), None);
    }

    #[test]
    fn test_persistence_across_restarts() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = PersistentStorage::open(temp_dir.path()).unwrap();
            let log = storage.open_log("delayed_0").unwrap();
            log.insert_records(vec![(7, b"durable".to_vec()), (300, b"x".to_vec())])
                .unwrap();
            log.set_meta("last_committed_index", 7).unwrap();
            storage.flush().unwrap();
        }

        {
            let storage = PersistentStorage::open(temp_dir.path()).unwrap();
            let log = storage.open_log("delayed_0").unwrap();
            assert_eq!(log.get_record(7).unwrap(), Some(b"durable".to_vec()));
            assert_eq!(log.record_indices().unwrap(), vec![7, 300]);
            assert_eq!(log.get_meta("last_committed_index").unwrap(), Some(7));
        }
    }
}
