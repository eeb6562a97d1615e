//! Typed JSON collections over a `KvBackend`.
//!
//! Records are stored as JSON documents. `update` runs a read-modify-CAS loop
//! so concurrent writers never lose an update; the closure may run more than
//! once and must be free of side effects.

use crate::error::StorageError;
use crate::store::{to_storage_data, KvBackend, Storage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

const MAX_CAS_ATTEMPTS: usize = 256;

/// Result of a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    /// The closure changed the record and the write won
    Applied(T),
    /// The closure declined to change the record
    Unchanged(T),
    /// No record under the key
    Missing,
}

impl<T> Update<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Update::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Update::Applied(_))
    }
}

pub struct Collection<T> {
    backend: Arc<dyn KvBackend>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    pub fn open(storage: &Storage, name: &str) -> Result<Self, StorageError> {
        Ok(Self {
            backend: storage.backend(name)?,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn get(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(key.as_bytes())? {
            Some(raw) => Ok(Some(self.decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Fetch or fail with `NotFound`
    pub fn require(&self, key: &str) -> Result<T, StorageError> {
        self.get(key)?.ok_or_else(|| StorageError::NotFound {
            collection: self.name().to_string(),
            key: key.to_string(),
        })
    }

    pub fn put(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.backend.insert(key.as_bytes(), self.encode(value)?)
    }

    /// Write only if the key is absent; `Ok(false)` if something is already there.
    pub fn insert_new(&self, key: &str, value: &T) -> Result<bool, StorageError> {
        self.backend
            .compare_and_swap(key.as_bytes(), None, Some(self.encode(value)?))
    }

    pub fn remove(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.remove(key.as_bytes())? {
            Some(raw) => Ok(Some(self.decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove only if the stored document still equals `expected`.
    pub fn remove_if(&self, key: &str, expected: &T) -> Result<bool, StorageError> {
        let expected = self.encode(expected)?;
        self.backend
            .compare_and_swap(key.as_bytes(), Some(&expected), None)
    }

    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, T)>, StorageError> {
        self.backend
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(key, raw)| Ok((String::from_utf8_lossy(&key).into_owned(), self.decode(&raw)?)))
            .collect()
    }

    pub fn values_with_prefix(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        Ok(self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Conditionally mutate a record.
    ///
    /// `mutate` returns `false` to leave the record untouched.
    pub fn update<F>(&self, key: &str, mut mutate: F) -> Result<Update<T>, StorageError>
    where
        F: FnMut(&mut T) -> bool,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.backend.get(key.as_bytes())? else {
                return Ok(Update::Missing);
            };
            let mut value = self.decode(&current)?;
            if !mutate(&mut value) {
                return Ok(Update::Unchanged(value));
            }
            let encoded = self.encode(&value)?;
            if self
                .backend
                .compare_and_swap(key.as_bytes(), Some(&current), Some(encoded))?
            {
                return Ok(Update::Applied(value));
            }
        }
        Err(self.contention(key))
    }

    /// Like `update`, creating the record from `init` first if absent.
    pub fn upsert<I, F>(&self, key: &str, init: I, mut mutate: F) -> Result<Update<T>, StorageError>
    where
        I: Fn() -> T,
        F: FnMut(&mut T) -> bool,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.backend.get(key.as_bytes())?;
            let mut value = match &current {
                Some(raw) => self.decode(raw)?,
                None => init(),
            };
            if !mutate(&mut value) {
                return Ok(Update::Unchanged(value));
            }
            let encoded = self.encode(&value)?;
            if self
                .backend
                .compare_and_swap(key.as_bytes(), current.as_deref(), Some(encoded))?
            {
                return Ok(Update::Applied(value));
            }
        }
        Err(self.contention(key))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(value).map_err(|e| to_storage_data(self.name(), e))
    }

    fn decode(&self, raw: &[u8]) -> Result<T, StorageError> {
        serde_json::from_slice(raw).map_err(|e| to_storage_data(self.name(), e))
    }

    fn contention(&self, key: &str) -> StorageError {
        StorageError::Contention {
            collection: self.name().to_string(),
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        }
    }
}

/// Secondary index: `group/member` keys with empty values.
#[derive(Clone)]
pub struct KeyIndex {
    backend: Arc<dyn KvBackend>,
}

impl KeyIndex {
    pub fn open(storage: &Storage, name: &str) -> Result<Self, StorageError> {
        Ok(Self {
            backend: storage.backend(name)?,
        })
    }

    pub fn add(&self, group: &str, member: &str) -> Result<(), StorageError> {
        self.backend
            .insert(index_key(group, member).as_bytes(), Vec::new())
    }

    pub fn remove(&self, group: &str, member: &str) -> Result<(), StorageError> {
        self.backend.remove(index_key(group, member).as_bytes())?;
        Ok(())
    }

    /// Members of a group in key order
    pub fn members(&self, group: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{group}/");
        Ok(self
            .backend
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[prefix.len()..]).into_owned())
            .collect())
    }
}

fn index_key(group: &str, member: &str) -> String {
    format!("{group}/{member}")
}
