use crate::store::StoreError;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};

/// Loads a value of type `T` from the store by key.
pub trait Loader<T>: Send + Sync {
    fn load(&self, key: &str) -> Result<Arc<T>, StoreError>;
}

/// A lazy, weakly cached handle to a stored value.
///
/// `value()` loads on first access and re-loads whenever the weakly held
/// value has been reclaimed in the meantime. The reference never mutates
/// the referent; repeated calls return observationally equal values.
/// Parent nodes hold their children through this type, so a loaded tree
/// never forms strong ownership cycles and subtrees can be evicted.
pub struct PersistentRef<T> {
    key: String,
    loader: Arc<dyn Loader<T>>,
    slot: Mutex<Weak<T>>,
}

impl<T> PersistentRef<T> {
    pub fn new(key: String, loader: Arc<dyn Loader<T>>) -> Self {
        PersistentRef {
            key,
            loader,
            slot: Mutex::new(Weak::new()),
        }
    }

    /// A reference whose cache slot starts out seeded, so the first access
    /// does not hit the store as long as `value` is alive elsewhere.
    pub fn with_value(key: String, loader: Arc<dyn Loader<T>>, value: &Arc<T>) -> Self {
        PersistentRef {
            key,
            loader,
            slot: Mutex::new(Arc::downgrade(value)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves the reference, loading if necessary.
    ///
    /// Two threads racing on the first load both succeed with
    /// observationally equal values; at most one wins the cache slot.
    pub fn value(&self) -> Result<Arc<T>, StoreError> {
        if let Some(value) = self.slot.lock().unwrap().upgrade() {
            return Ok(value);
        }
        // load outside the lock: loaders may block on I/O
        let loaded = self.loader.load(&self.key)?;
        let mut slot = self.slot.lock().unwrap();
        if let Some(value) = slot.upgrade() {
            return Ok(value);
        }
        *slot = Arc::downgrade(&loaded);
        Ok(loaded)
    }

    /// The currently cached value, without forcing a load.
    pub fn try_value(&self) -> Option<Arc<T>> {
        self.slot.lock().unwrap().upgrade()
    }
}

impl<T> Clone for PersistentRef<T> {
    fn clone(&self) -> Self {
        PersistentRef {
            key: self.key.clone(),
            loader: Arc::clone(&self.loader),
            slot: Mutex::new(self.slot.lock().unwrap().clone()),
        }
    }
}

impl<T> Debug for PersistentRef<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRef")
            .field("key", &self.key)
            .field("cached", &self.try_value().is_some())
            .finish()
    }
}
