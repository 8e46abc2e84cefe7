//! Record validation and the local record store

use crate::datastore::{self, DatastoreHandle};
use crate::{DhtError, Result};
use keepnet_core::proto::Record;
use tracing::warn;

/// Decides which records the node accepts and which of several wins
pub trait Validator: Send + Sync {
    /// Reject a record that must not be stored or returned
    fn validate(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Index of the best value among `values`
    fn select(&self, key: &str, values: &[&[u8]]) -> Result<usize>;
}

/// Accepts every record and always prefers the first candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl Validator for PermissiveValidator {
    fn validate(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn select(&self, _key: &str, values: &[&[u8]]) -> Result<usize> {
        if values.is_empty() {
            return Err(DhtError::InvalidRecord("no values to select from".to_string()));
        }
        Ok(0)
    }
}

/// Records stored on this node, keyed by their DHT key
#[derive(Clone)]
pub struct LocalStore {
    ds: DatastoreHandle,
}

impl LocalStore {
    pub fn new(ds: DatastoreHandle) -> Self {
        Self { ds }
    }

    pub fn datastore(&self) -> &DatastoreHandle {
        &self.ds
    }

    /// The stored record for `key`, if any.
    ///
    /// A record whose embedded key differs from `key` is treated as absent.
    pub fn get_local(&self, key: &str) -> Result<Option<Record>> {
        let buf = match self.ds.get(key) {
            Ok(buf) => buf,
            Err(datastore::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let rec = Record::from_bytes(&buf)?;
        if rec.key != key.as_bytes() {
            warn!("local record key mismatch for {}", key);
            return Ok(None);
        }
        Ok(Some(rec))
    }

    pub fn put_local(&self, key: &str, rec: &Record) -> Result<()> {
        self.ds.put(key, rec.to_bytes())?;
        Ok(())
    }

    pub fn delete_local(&self, key: &str) -> Result<()> {
        self.ds.delete(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatastore;
    use std::sync::Arc;

    #[test]
    fn test_put_get_delete_local() {
        let store = LocalStore::new(Arc::new(MemoryDatastore::new()));
        assert!(store.get_local("k").unwrap().is_none());

        store.put_local("k", &Record::new("k", "v")).unwrap();
        assert_eq!(store.get_local("k").unwrap().unwrap().value, b"v");

        store.delete_local("k").unwrap();
        assert!(store.get_local("k").unwrap().is_none());
    }

    #[test]
    fn test_mismatched_key_reads_as_absent() {
        let store = LocalStore::new(Arc::new(MemoryDatastore::new()));
        store.put_local("k", &Record::new("other", "v")).unwrap();
        assert!(store.get_local("k").unwrap().is_none());
    }

    #[test]
    fn test_permissive_select() {
        let v = PermissiveValidator;
        assert!(v.validate("k", b"anything").is_ok());
        assert_eq!(v.select("k", &[b"a".as_slice(), b"b".as_slice()]).unwrap(), 0);
        assert!(v.select("k", &[]).is_err());
    }
}
