//! The blob persister contract and its redb implementation.
//!
//! Writes are durable before the call returns; reads observe the latest
//! durable write. There are no multi-key transactions — callers order
//! their writes so a single sentinel key lands last.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// All blobs live in one table keyed by path.
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// A flat namespace of byte blobs keyed by `/`-separated paths.
pub trait Persister: Send + Sync {
    /// Fetch the blob at `path`. Fails with `NotFound` when absent.
    fn get(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Durably write the blob at `path`, replacing any previous value.
    fn set(&self, path: &str, value: &[u8]) -> StoreResult<()>;

    /// Delete the blob at `path`. Fails with `NotFound` when absent.
    fn delete(&self, path: &str) -> StoreResult<()>;

    /// Delete `path` and everything beneath it. Deleting an empty subtree
    /// is not an error. Returns the number of blobs removed.
    fn recursive_delete(&self, path: &str) -> StoreResult<u32>;

    /// Immediate child names under `path`, deduplicated, in key order.
    fn list(&self, path: &str) -> StoreResult<Vec<String>>;
}

/// Persister backed by redb, on-disk or in-memory.
#[derive(Clone)]
pub struct RedbPersister {
    db: Arc<Database>,
}

impl RedbPersister {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Storage))?;
        let persister = Self { db: Arc::new(db) };
        persister.ensure_table()?;
        debug!(?path, "persister opened");
        Ok(persister)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Storage))?;
        let persister = Self { db: Arc::new(db) };
        persister.ensure_table()?;
        debug!("in-memory persister opened");
        Ok(persister)
    }

    fn ensure_table(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BLOBS).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    /// Keys equal to `path` or beneath it.
    fn keys_under(&self, path: &str) -> StoreResult<Vec<String>> {
        let prefix = subtree_prefix(path);
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, _) = entry.map_err(map_err!(Storage))?;
            let k = key.value().to_string();
            if k == path || k.starts_with(&prefix) {
                keys.push(k);
            }
        }
        Ok(keys)
    }
}

impl Persister for RedbPersister {
    fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
        match table.get(path).map_err(map_err!(Storage))? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    fn set(&self, path: &str, value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
            table.insert(path, value).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let existed;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
            existed = table.remove(path).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Storage))?;
        if existed {
            Ok(())
        } else {
            Err(StoreError::NotFound(path.to_string()))
        }
    }

    fn recursive_delete(&self, path: &str) -> StoreResult<u32> {
        let keys = self.keys_under(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Storage))?;
        debug!(path, removed = keys.len(), "recursive delete");
        Ok(keys.len() as u32)
    }

    fn list(&self, path: &str) -> StoreResult<Vec<String>> {
        let prefix = subtree_prefix(path);
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Storage))?;
        let mut children = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, _) = entry.map_err(map_err!(Storage))?;
            if let Some(rest) = key.value().strip_prefix(&prefix) {
                let child = match rest.split_once('/') {
                    Some((first, _)) => first,
                    None => rest,
                };
                if !child.is_empty() && children.last().map(String::as_str) != Some(child) {
                    children.push(child.to_string());
                }
            }
        }
        Ok(children)
    }
}

/// The prefix that matches everything strictly beneath `path`.
fn subtree_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path.trim_end_matches('/'))
    }
}
