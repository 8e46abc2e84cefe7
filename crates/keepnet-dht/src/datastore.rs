//! Local persistence for DHT records and provider entries
//!
//! Keys are strings. DHT records are stored under their raw key;
//! provider entries live under `/providers/...` (see [`crate::providers`]).

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Sentinel for a missing key; never used for backend failures
    #[error("datastore: key not found")]
    NotFound,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A write applied as part of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Key/value storage shared by the DHT and the provider manager.
///
/// Implementations must be safe for concurrent use.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    fn has(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All entries whose key starts with `prefix`, in key order
    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply several writes; backends that can do so apply them atomically
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        for op in ops {
            match op {
                BatchOp::Put(key, value) => self.put(&key, value)?,
                BatchOp::Delete(key) => self.delete(&key)?,
            }
        }
        Ok(())
    }
}

/// A shareable datastore handle
pub type DatastoreHandle = Arc<dyn Datastore>;

/// Datastore kept entirely in memory
#[derive(Default)]
pub struct MemoryDatastore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        lock(&self.entries).get(key).cloned().ok_or(Error::NotFound)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(lock(&self.entries)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut entries = lock(&self.entries);
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Datastore backed by a single SQLite table
pub struct SqliteDatastore {
    conn: Mutex<Connection>,
}

impl SqliteDatastore {
    /// Open or create the datastore database
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Datastore for SqliteDatastore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let conn = lock(&self.conn);
        conn.query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| row.get(0))
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.conn).execute("DELETE FROM kv WHERE key = ?", params![key])?;
        Ok(())
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
                        params![key, value],
                    )?;
                }
                BatchOp::Delete(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Buffers writes in memory and hands them to the backing store in
/// batches. Reads see buffered writes. Owned by a single task.
pub struct AutoBatch {
    inner: DatastoreHandle,
    /// `None` marks a buffered delete
    pending: HashMap<String, Option<Vec<u8>>>,
    max_pending: usize,
}

impl AutoBatch {
    pub fn new(inner: DatastoreHandle, max_pending: usize) -> Self {
        Self {
            inner,
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.pending.get(key) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(Error::NotFound),
            None => self.inner.get(key),
        }
    }

    pub fn put(&mut self, key: String, value: Vec<u8>) -> Result<()> {
        self.pending.insert(key, Some(value));
        self.maybe_flush()
    }

    pub fn delete(&mut self, key: String) -> Result<()> {
        self.pending.insert(key, None);
        self.maybe_flush()
    }

    /// Flushes buffered writes first so the scan sees them
    pub fn query_prefix(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.flush()?;
        self.inner.query_prefix(prefix)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = self
            .pending
            .drain()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put(key, value),
                None => BatchOp::Delete(key),
            })
            .collect();
        self.inner.batch(ops)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.pending.len() >= self.max_pending {
            self.flush()?;
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
