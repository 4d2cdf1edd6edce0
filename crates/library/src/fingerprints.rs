use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::debug;

use crate::{decode_value, encode_value, open_or_create_db, LibraryError};

const FINGERPRINTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("fingerprints");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const META_VERSION_KEY: &str = "version";

/// Persistent path -> fingerprint map plus the schema version marker.
#[derive(Clone)]
pub struct FingerprintStore {
    db: Arc<Database>,
}

impl FingerprintStore {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, path: &str) -> Result<Option<String>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(FINGERPRINTS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = table.get(path)?.map(|value| value.value().to_string());
        Ok(value)
    }

    pub fn put(&self, path: &str, fingerprint: &str) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            table.insert(path, fingerprint)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            let removed = table.remove(path)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Drops every record whose path starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(FINGERPRINTS_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.range(prefix..)? {
                let entry = entry?;
                let key = entry.0.value();
                if !key.starts_with(prefix) {
                    break;
                }
                keys.push(key.to_string());
            }
            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys.len()
        };
        write_txn.commit()?;
        debug!("Removed {} fingerprints under {}", removed, prefix);
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        match write_txn.delete_table(FINGERPRINTS_TABLE) {
            Ok(_) => {}
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(err) => return Err(err.into()),
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(FINGERPRINTS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, LibraryError> {
        Ok(self.len()? == 0)
    }

    pub fn schema_version(&self) -> Result<Option<u32>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(META_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let version = match table.get(META_VERSION_KEY)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(version)
    }

    pub fn set_schema_version(&self, version: u32) -> Result<(), LibraryError> {
        let bytes = encode_value(&version)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(META_VERSION_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, FingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_overwrites_single_record() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get("/media/a.mp3").unwrap(), None);
        store.put("/media/a.mp3", "one").unwrap();
        store.put("/media/a.mp3", "two").unwrap();
        assert_eq!(store.get("/media/a.mp3").unwrap(), Some("two".to_string()));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn remove_prefix_spares_siblings() {
        let (_dir, store) = open_temp();
        store.put("/media/x/a.mp3", "1").unwrap();
        store.put("/media/x/deep/b.mp3", "2").unwrap();
        store.put("/media/xy/c.mp3", "3").unwrap();

        assert_eq!(store.remove_prefix("/media/x/").unwrap(), 2);
        assert_eq!(store.get("/media/x/a.mp3").unwrap(), None);
        assert_eq!(store.get("/media/xy/c.mp3").unwrap(), Some("3".to_string()));
    }

    #[test]
    fn remove_prefix_reaches_the_highest_code_points() {
        let (_dir, store) = open_temp();
        store.put("/media/x/\u{10ffff}.mp3", "1").unwrap();
        store.put("/media/x/\u{10ffff}\u{10ffff}/b.mp3", "2").unwrap();
        store.put("/media/x0", "3").unwrap();

        assert_eq!(store.remove_prefix("/media/x/").unwrap(), 2);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get("/media/x0").unwrap(), Some("3".to_string()));
    }

    #[test]
    fn remove_reports_presence() {
        let (_dir, store) = open_temp();
        store.put("/media/a.jpg", "1").unwrap();
        assert!(store.remove("/media/a.jpg").unwrap());
        assert!(!store.remove("/media/a.jpg").unwrap());
    }

    #[test]
    fn schema_version_survives_clear() {
        let (dir, store) = open_temp();
        assert_eq!(store.schema_version().unwrap(), None);
        store.put("/media/a.jpg", "1").unwrap();
        store.set_schema_version(3).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
        drop(store);

        let reopened = FingerprintStore::open(&dir.path().join("state.redb")).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), Some(3));
    }
}
