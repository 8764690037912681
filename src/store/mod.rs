pub mod cache;
pub mod memory;
pub mod reference;

use crate::store::cache::WeakCache;
use std::sync::Arc;
use thiserror::Error;

/// Errors of the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend failed at key {key}: {message}")]
    Backend { key: String, message: String },

    /// An append-only `put` found different bytes under the key.
    #[error("key {key} already holds different content")]
    Conflict { key: String },

    #[error("blob {key} does not decode: {message}")]
    Codec { key: String, message: String },

    /// A reference pointed at a blob that is not in the store. This is a
    /// data integrity error: referenced blobs are written before their
    /// referents, so they must exist.
    #[error("missing blob {key}")]
    Missing { key: String },
}

impl StoreError {
    pub(crate) fn codec(key: &str, message: impl Into<String>) -> Self {
        StoreError::Codec {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Content-addressed, append-only byte-blob persistence.
///
/// Implementations must tolerate concurrent `put` of identical bytes for
/// the same key. A `put` with differing bytes for an existing key fails
/// with [StoreError::Conflict] and must not corrupt other keys.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Replaces the value under `key`. This exists for the two sanctioned
    /// mutations: republishing a node record under its id with a superset
    /// of attributes (lod and normal generation), and rewriting a named
    /// point set handle (last writer wins). Every other write goes through
    /// [Self::put].
    fn put_superseding(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// A blob store paired with the process-local weak cache.
///
/// Cloning is cheap and clones share the cache. Typed reads go through the
/// cache first and fall back to the persistent layer, so the working set
/// can exceed RAM: values are handed out as [Arc]s and reloaded after the
/// last strong reference is gone.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn BlobStore>,
    cache: Arc<WeakCache>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Storage {
            store,
            cache: Arc::new(WeakCache::new()),
        }
    }

    pub fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.store.put(key, data)
    }

    pub fn put_superseding(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.store.put_superseding(key, data)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(key)
    }

    pub fn get_required(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.get(key)?.ok_or_else(|| StoreError::Missing {
            key: key.to_string(),
        })
    }

    pub fn cache_put<T: Send + Sync + 'static>(&self, key: &str, value: &Arc<T>) {
        self.cache.put(key, value);
    }

    pub fn cache_get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key)
    }

    /// Drops a cache entry. Used when a node record is republished so
    /// subsequent loads observe the new record.
    pub fn cache_remove(&self, key: &str) {
        self.cache.remove(key);
    }

    /// Writes the encoded value and seeds the cache with it.
    pub fn put_typed<T, E>(&self, key: &str, value: &Arc<T>, encode: E) -> Result<(), StoreError>
    where
        T: Send + Sync + 'static,
        E: FnOnce(&T) -> Vec<u8>,
    {
        self.put(key, &encode(value))?;
        self.cache_put(key, value);
        Ok(())
    }

    /// Reads through the weak cache, decoding on a miss.
    pub fn get_typed<T, D>(&self, key: &str, decode: D) -> Result<Option<Arc<T>>, StoreError>
    where
        T: Send + Sync + 'static,
        D: FnOnce(&[u8]) -> Result<T, String>,
    {
        if let Some(value) = self.cache_get::<T>(key) {
            return Ok(Some(value));
        }
        let Some(bytes) = self.get(key)? else {
            return Ok(None);
        };
        let value = Arc::new(decode(&bytes).map_err(|message| StoreError::codec(key, message))?);
        self.cache_put(key, &value);
        Ok(Some(value))
    }
}
