//! In-process [`BlobStore`] for tests and throwaway stores.

use std::collections::BTreeMap;
use std::path::Path;

use super::BlobStore;
use crate::error::{Result, StoreError};

/// Records held in a map keyed by a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    name: String,
    records: BTreeMap<u32, Vec<u8>>,
    next_key: u32,
}

impl MemoryBlobStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn invalid(&self, key: u32) -> StoreError {
        StoreError::InvalidKey {
            store: self.name.clone(),
            key,
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&mut self, pieces: &[&[u8]]) -> Result<u32> {
        let key = self.next_key;
        self.next_key += 1;
        self.records.insert(key, pieces.concat());
        Ok(key)
    }

    fn load(&mut self, key: u32, length: u32) -> Result<Vec<u8>> {
        let data = self.records.get(&key).ok_or_else(|| self.invalid(key))?;
        let end = data.len().min(length as usize);
        Ok(data[..end].to_vec())
    }

    fn free(&mut self, key: u32, _length: u32) -> Result<()> {
        self.records
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| self.invalid(key))
    }

    fn compact(
        &mut self,
        key: u32,
        length: u32,
        source: Option<&mut dyn BlobStore>,
    ) -> Result<u32> {
        match source {
            Some(source) => {
                let data = source.load(key, length)?;
                if data.len() != length as usize {
                    return Err(StoreError::ShortRead {
                        key,
                        expected: length,
                        actual: data.len() as u32,
                    });
                }
                self.save(&[&data])
            }
            None if self.records.contains_key(&key) => Ok(key),
            None => Err(self.invalid(key)),
        }
    }

    fn free_unreferenced(&mut self, refs: &[(u32, u32)]) -> Result<()> {
        self.records
            .retain(|key, _| refs.iter().any(|&(k, _)| k == *key));
        Ok(())
    }

    fn free_unused(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn rename(&mut self, _dir: &Path, base_name: &str) -> Result<()> {
        self.name = base_name.to_string();
        Ok(())
    }

    fn create_empty(&self, base_name: &str) -> Result<Box<dyn BlobStore>> {
        Ok(Box::new(MemoryBlobStore::new(base_name)))
    }

    fn remove(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn allocated_bytes(&self) -> u64 {
        self.records.values().map(|r| r.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_free() {
        let mut store = MemoryBlobStore::new("mem");
        let key = store.save(&[b"ab", b"cd"]).unwrap();
        assert_eq!(store.load(key, 4).unwrap(), b"abcd");
        assert_eq!(store.load(key, 2).unwrap(), b"ab");
        store.free(key, 4).unwrap();
        assert!(store.load(key, 4).is_err());
        assert!(store.free(key, 4).is_err());
    }

    #[test]
    fn test_keys_not_reused() {
        let mut store = MemoryBlobStore::new("mem");
        let a = store.save(&[b"a"]).unwrap();
        store.free(a, 1).unwrap();
        let b = store.save(&[b"b"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_free_unreferenced() {
        let mut store = MemoryBlobStore::new("mem");
        let keep = store.save(&[b"keep"]).unwrap();
        store.save(&[b"leak"]).unwrap();
        store.free_unreferenced(&[(keep, 4)]).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.allocated_bytes(), 4);
    }
}
