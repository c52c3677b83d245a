//! Message Index: cached access to the raw summary fields of index records.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::lru::{CachedRecords, RecordCodec};
use crate::model::field::{CacheField, IndexField};
use crate::parser::header::{decode_encoded_words, MessageHeader};
use crate::store::record::{self, CacheEntry, IndexRecord};
use crate::store::{or_empty_record, MessageStore};

/// Default number of index records kept in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug)]
struct IndexCodec;

impl RecordCodec for IndexCodec {
    type Entry = IndexRecord;
    type Field = IndexField;

    fn decode(&self, data: &[u8]) -> IndexRecord {
        IndexRecord::parse(record::split(data).0)
    }

    fn field(&self, entry: &IndexRecord, field: IndexField) -> String {
        entry.get(field).to_string()
    }
}

/// LRU-cached reader of index records.
///
/// Not synchronized: callers serialize access through `&mut self`.
pub struct MessageIndex {
    store: Arc<dyn MessageStore>,
    records: CachedRecords<IndexCodec>,
}

impl MessageIndex {
    /// Index over `store`, keeping at most `max_entries` parsed records
    /// (0 disables caching).
    pub fn new(store: Arc<dyn MessageStore>, max_entries: usize) -> Self {
        Self {
            store,
            records: CachedRecords::new(IndexCodec, max_entries),
        }
    }

    /// Build the index record for a new message.
    pub fn create_index(header: &MessageHeader, label: &str) -> Vec<u8> {
        record::build(header, label)
    }

    /// One field of the record at `key`. A damaged record reads as empty
    /// fields.
    pub fn get(&mut self, key: u32, length: u32, field: IndexField) -> Result<String> {
        let store = &self.store;
        self.records.get_or_load(key, field, || {
            or_empty_record(key, store.read_index(key, length))
        })
    }

    /// A complete record equal to the one at `key` except for `field`.
    ///
    /// The decoded display copy of the field is refreshed as well, so the
    /// Message Cache sees the new value after the record is rewritten.
    pub fn create_replaced_index(
        &mut self,
        key: u32,
        length: u32,
        field: IndexField,
        value: &str,
    ) -> Result<Vec<u8>> {
        let data = self.store.read_index(key, length)?;
        let (text, cache) = record::split(&data);

        let mut index = IndexRecord::parse(text);
        index.set(field, value);

        let mut entry = CacheEntry::parse(cache);
        match field.cache_field() {
            Some(CacheField::Reference) => {
                let parent = value.split_whitespace().last().unwrap_or_default();
                entry.set(CacheField::Reference, parent.to_string());
            }
            Some(cache_field) => entry.set(cache_field, decode_encoded_words(value)),
            None => {}
        }
        debug!(key, ?field, "Replaced index field");
        Ok(record::compose(&index.encode(), &entry.encode()))
    }

    /// Drop a cached record. The stored record is left alone.
    pub fn remove(&mut self, key: u32) {
        self.records.remove(key);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Cached keys, most recently used first.
    pub fn cached_keys(&self) -> Vec<u32> {
        self.records.keys()
    }
}
