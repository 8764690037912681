use crate::store::{BlobStore, StoreError};
use std::collections::HashMap;
use std::sync::RwLock;

/// The reference [BlobStore]: a map of keys to byte blobs. On-disk and
/// remote stores implement the same trait outside of this crate.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().unwrap();
        match blobs.get(key) {
            Some(existing) if existing == data => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                key: key.to_string(),
            }),
            None => {
                blobs.insert(key.to_string(), data.to_vec());
                Ok(())
            }
        }
    }

    fn put_superseding(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }
}
