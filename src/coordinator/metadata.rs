//! Metadata store using RocksDB
//!
//! Durable backing for the persistent records of the coordination substrate:
//! - Collection state records (`/collections/<name>/state.json`)
//! - Cluster properties (`/clusterprops.json`)
//! - Substrate bookkeeping such as the global revision

use crate::common::Result;
use rocksdb::{ColumnFamily, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_RECORDS: &str = "records";
const CF_CONFIG: &str = "config";

/// A persisted substrate record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub version: u64,
    pub data: Vec<u8>,
}

/// Metadata store
pub struct MetadataStore {
    db: DB,
}

impl MetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_RECORDS, CF_CONFIG])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    // === Record operations ===

    pub fn put_record(&self, path: &str, record: &StoredRecord) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(self.cf(CF_RECORDS)?, path.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_record(&self, path: &str) -> Result<Option<StoredRecord>> {
        match self.db.get_cf(self.cf(CF_RECORDS)?, path.as_bytes())? {
            Some(bytes) => {
                let record: StoredRecord = bincode::deserialize(&bytes)
                    .map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn delete_record(&self, path: &str) -> Result<()> {
        self.db.delete_cf(self.cf(CF_RECORDS)?, path.as_bytes())?;
        Ok(())
    }

    /// List all records (used when the substrate starts)
    pub fn list_records(&self) -> Result<Vec<(String, StoredRecord)>> {
        let iter = self
            .db
            .iterator_cf(self.cf(CF_RECORDS)?, rocksdb::IteratorMode::Start);

        let mut records = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            let path = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| crate::Error::MetadataCorrupted("Invalid UTF-8".into()))?;
            let record: StoredRecord = bincode::deserialize(&value_bytes)
                .map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))?;
            records.push((path, record));
        }

        Ok(records)
    }

    // === Config operations ===

    /// Put config value
    pub fn put_config(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf(CF_CONFIG)?, key.as_bytes(), value)?;
        Ok(())
    }

    /// Get config value
    pub fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(CF_CONFIG)?, key.as_bytes())?)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("test.db")).unwrap();

        let record = StoredRecord {
            version: 3,
            data: br#"{"name":"c","shards":[]}"#.to_vec(),
        };
        store.put_record("/collections/c/state.json", &record).unwrap();

        let retrieved = store.get_record("/collections/c/state.json").unwrap().unwrap();
        assert_eq!(retrieved, record);

        store.delete_record("/collections/c/state.json").unwrap();
        assert!(store.get_record("/collections/c/state.json").unwrap().is_none());
    }

    #[test]
    fn test_list_records_sorted() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("test.db")).unwrap();

        for name in ["b", "a"] {
            let record = StoredRecord {
                version: 0,
                data: vec![],
            };
            store
                .put_record(&format!("/collections/{}/state.json", name), &record)
                .unwrap();
        }

        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "/collections/a/state.json");
        store.flush().unwrap();
    }

    #[test]
    fn test_config_values() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("test.db")).unwrap();
        assert!(store.get_config("revision").unwrap().is_none());
        store.put_config("revision", b"7").unwrap();
        assert_eq!(store.get_config("revision").unwrap().unwrap(), b"7");
    }
}
