//! redb database and table definitions

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::error::StorageError;

/// Scan result rows: (key bytes, value bytes)
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

// Key: bundle id (u64 big-endian), Value: postcard BundleRecord
pub const BUNDLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bundles");

// Key: bundle id (u64 big-endian), Value: postcard BundleDetailRecord.
// Denormalized columns for external inspection; write-only from the
// daemon's perspective.
pub const BUNDLE_DETAILS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bundle_details");

// Key: link name bytes, Value: postcard LinkRecord
pub const LINKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("links");

// Key: regid (u32 big-endian), Value: postcard RegistrationRecord
pub const REGISTRATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("registrations");

// Key: (custodian, succeeded, reason) composite, Value: postcard PendingAcsRecord
pub const PENDING_ACS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pending_acs");

/// The node's redb database with byte-oriented table access
///
/// Typed record handling lives in [`crate::bundle_store`]; this layer is
/// plain put/get/delete/scan over the table definitions above.
pub struct NodeDb {
    db: Arc<Database>,
}

impl NodeDb {
    /// Open or create the database and initialize every table
    pub fn open(path: &PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| StorageError::Database(e.to_string()))?;
        info!(path = %path.display(), "opened node database");

        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), StorageError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        for table in [BUNDLES, BUNDLE_DETAILS, LINKS, REGISTRATIONS, PENDING_ACS] {
            txn.open_table(table)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        txn.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        debug!("initialized node tables");
        Ok(())
    }

    /// Insert or replace a key
    pub fn put(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            let mut t = txn
                .open_table(table)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            t.insert(key, value)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        txn.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    /// Look up a key
    pub fn get(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let t = txn
            .open_table(table)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(t.get(key)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .map(|v| v.value().to_vec()))
    }

    /// Delete a key; true if it was present
    pub fn delete(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let removed = {
            let mut t = txn
                .open_table(table)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            t.remove(key)
                .map_err(|e| StorageError::Database(e.to_string()))?
                .is_some()
        };
        txn.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(removed)
    }

    /// All rows of a table, key order
    pub fn scan_all(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
    ) -> Result<ScanResults, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let t = txn
            .open_table(table)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let mut results = Vec::new();
        for entry in t
            .iter()
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (key, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            results.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(results)
    }

    /// Number of rows in a table
    pub fn count(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
    ) -> Result<usize, StorageError> {
        self.scan_all(table).map(|rows| rows.len())
    }
}

/// Big-endian key for id-keyed tables
pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Big-endian key for regid-keyed tables
pub fn regid_key(regid: u32) -> [u8; 4] {
    regid.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (NodeDb, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = NodeDb::open(&temp.path().join("node.redb")).unwrap();
        (db, temp)
    }

    #[test]
    fn test_put_get_delete() {
        let (db, _temp) = create_test_db();

        db.put(BUNDLES, &id_key(1), b"record").unwrap();
        assert_eq!(db.get(BUNDLES, &id_key(1)).unwrap(), Some(b"record".to_vec()));

        assert!(db.delete(BUNDLES, &id_key(1)).unwrap());
        assert!(!db.delete(BUNDLES, &id_key(1)).unwrap());
        assert!(db.get(BUNDLES, &id_key(1)).unwrap().is_none());
    }

    #[test]
    fn test_scan_all_in_key_order() {
        let (db, _temp) = create_test_db();

        for id in [3u64, 1, 2] {
            db.put(BUNDLES, &id_key(id), &id.to_le_bytes()).unwrap();
        }

        let rows = db.scan_all(BUNDLES).unwrap();
        let keys: Vec<u64> = rows
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(db.count(BUNDLES).unwrap(), 3);
    }

    #[test]
    fn test_tables_are_separate() {
        let (db, _temp) = create_test_db();
        db.put(LINKS, b"link-a", b"x").unwrap();
        assert!(db.get(BUNDLES, b"link-a").unwrap().is_none());
        assert!(db.get(LINKS, b"link-a").unwrap().is_some());
    }
}
