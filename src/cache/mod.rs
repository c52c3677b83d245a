//! Message Cache: decoded display strings, shared between threads.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::lru::{CachedRecords, RecordCodec};
use crate::model::field::CacheField;
use crate::parser::header::MessageHeader;
use crate::store::record::{self, CacheEntry};
use crate::store::{or_empty_record, MessageStore};

/// Default number of decoded entries kept in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug)]
struct CacheCodec;

impl RecordCodec for CacheCodec {
    type Entry = CacheEntry;
    type Field = CacheField;

    fn decode(&self, data: &[u8]) -> CacheEntry {
        CacheEntry::parse(record::split(data).1)
    }

    fn field(&self, entry: &CacheEntry, field: CacheField) -> String {
        entry.get(field).to_string()
    }

    fn decode_field(&self, data: &[u8], field: CacheField) -> String {
        record::cache_field(record::split(data).1, field)
    }
}

/// LRU of decoded cache entries keyed by index key.
pub struct MessageCache {
    store: Arc<dyn MessageStore>,
    records: Mutex<CachedRecords<CacheCodec>>,
}

impl MessageCache {
    pub fn new(store: Arc<dyn MessageStore>, max_entries: usize) -> Self {
        Self {
            store,
            records: Mutex::new(CachedRecords::new(CacheCodec, max_entries)),
        }
    }

    /// Build the cache section for a header, decoding everything up front.
    pub fn create_data(header: &MessageHeader) -> Vec<u8> {
        CacheEntry::from_header(header).encode()
    }

    /// One decoded field of the record at `key`. A damaged record reads as
    /// empty fields.
    pub fn get_data(&self, key: u32, field: CacheField) -> Result<String> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get_or_load(key, field, || {
            or_empty_record(key, self.store.read_record(key))
        })
    }

    /// Forget the entry for `key`.
    pub fn remove_data(&self, key: u32) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::parser::message::Message;
    use crate::store::SingleFileStore;

    fn setup(max_entries: usize) -> (MessageCache, u32) {
        let store: Arc<dyn MessageStore> = Arc::new(SingleFileStore::with_blob_stores(
            "unused",
            Box::new(MemoryBlobStore::new("msg")),
            Box::new(MemoryBlobStore::new("index")),
        ));
        let raw = b"From: =?ISO-8859-1?Q?J=F6rg?= <j@example.com>\r\n\
                    Subject: =?UTF-8?B?w5xiZXI=?=\r\n\
                    In-Reply-To: <parent@example.com>\r\n\r\nbody";
        let loc = store.save(&Message::new(&raw[..]), "", true).unwrap();
        (MessageCache::new(store, max_entries), loc.index_key)
    }

    #[test]
    fn test_decoded_fields() {
        let (cache, key) = setup(10);
        assert_eq!(cache.get_data(key, CacheField::From).unwrap(), "Jörg");
        assert_eq!(cache.get_data(key, CacheField::Subject).unwrap(), "Über");
        assert_eq!(
            cache.get_data(key, CacheField::Reference).unwrap(),
            "<parent@example.com>"
        );
        assert_eq!(cache.len(), 1);
        cache.remove_data(key);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_still_reads() {
        let (cache, key) = setup(0);
        assert_eq!(cache.get_data(key, CacheField::Subject).unwrap(), "Über");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_create_data_matches_stored_section() {
        let header = MessageHeader::parse(b"Subject: Hi\r\n");
        let section = MessageCache::create_data(&header);
        assert_eq!(record::cache_field(&section, CacheField::Subject), "Hi");
    }

    #[test]
    fn test_oversized_prefix_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(SingleFileStore::open(dir.path()).unwrap());
        let loc = store
            .save(&Message::new(&b"Subject: Hi\r\n\r\nbody"[..]), "", true)
            .unwrap();
        let damaged = [0xF0, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, b'x'];
        let (key, _) = store
            .update_index(loc.index_key, loc.index_length, &damaged)
            .unwrap();

        let cache = MessageCache::new(Arc::clone(&store), 4);
        assert_eq!(cache.get_data(key, CacheField::Subject).unwrap(), "");
        let uncached = MessageCache::new(store, 0);
        assert_eq!(uncached.get_data(key, CacheField::From).unwrap(), "");
    }

    #[test]
    fn test_shared_between_threads() {
        let (cache, key) = setup(4);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_data(key, CacheField::Subject).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "Über");
        }
    }
}
