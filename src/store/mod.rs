//! Durable Store
//!
//! Every engine collaborator persists through the same small contract: a
//! named key-value backend with atomic compare-and-swap and prefix scans.
//! sled provides the durable implementation; an in-memory backend backs
//! unit tests and throwaway runs.

pub mod collection;
pub mod persistence;

pub use collection::{Collection, KeyIndex, Update};
pub use persistence::{MemoryBackend, SledBackend};

use crate::config::StorageConfig;
use crate::error::StorageError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Key-value backend with conditional writes.
pub trait KvBackend: Send + Sync {
    /// Collection name, used in error messages
    fn name(&self) -> &str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically replace `expected` with `new`.
    ///
    /// `expected = None` means "key absent"; `new = None` deletes. Returns
    /// `Ok(false)` when the stored value no longer matches `expected`.
    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Handle to the storage root; hands out named backends.
#[derive(Clone)]
pub enum Storage {
    Sled(sled::Db),
    Memory(Arc<Mutex<HashMap<String, Arc<MemoryBackend>>>>),
}

impl Storage {
    /// Open (or create) a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(to_storage_io)?;
        Ok(Storage::Sled(db))
    }

    /// A sled database removed when the last handle drops.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(to_storage_io)?;
        Ok(Storage::Sled(db))
    }

    pub fn in_memory() -> Self {
        Storage::Memory(Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn from_config(config: &StorageConfig, workspace_root: &Path) -> Result<Self, StorageError> {
        if config.temporary {
            return Self::temporary();
        }
        let path = config.resolve_path(workspace_root);
        std::fs::create_dir_all(&path)?;
        Self::open(path)
    }

    /// Open the backend for a named collection.
    pub fn backend(&self, name: &str) -> Result<Arc<dyn KvBackend>, StorageError> {
        match self {
            Storage::Sled(db) => {
                let tree = db.open_tree(name).map_err(to_storage_io)?;
                Ok(Arc::new(SledBackend::new(name, tree)))
            }
            Storage::Memory(trees) => {
                let mut trees = trees.lock();
                let backend = trees
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(MemoryBackend::new(name)));
                Ok(Arc::clone(backend) as Arc<dyn KvBackend>)
            }
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        if let Storage::Sled(db) = self {
            db.flush().map_err(to_storage_io)?;
        }
        Ok(())
    }
}

pub(crate) fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

pub(crate) fn to_storage_data(collection: &str, err: serde_json::Error) -> StorageError {
    StorageError::Corrupt {
        collection: collection.to_string(),
        reason: err.to_string(),
    }
}
