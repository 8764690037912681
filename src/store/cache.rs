use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Process-local cache holding weak references, keyed by blob key.
///
/// The cache never keeps a value alive: entries are upgradeable only while
/// some consumer still holds the [Arc], so the resident set shrinks under
/// memory pressure as soon as consumers drop their handles. Dead entries
/// are pruned opportunistically on insert.
pub struct WeakCache {
    entries: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
}

impl WeakCache {
    pub fn new() -> Self {
        WeakCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn put<T: Send + Sync + 'static>(&self, key: &str, value: &Arc<T>) {
        let value: Arc<dyn Any + Send + Sync> = value.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&value);
        let mut entries = self.entries.lock().unwrap();
        if entries.len() > 2 * entries.capacity() / 3 {
            entries.retain(|_, slot| slot.strong_count() > 0);
        }
        entries.insert(key.to_string(), weak);
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock().unwrap();
        let value = entries.get(key)?.upgrade()?;
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

impl Default for WeakCache {
    fn default() -> Self {
        Self::new()
    }
}
