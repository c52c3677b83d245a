//! Single-file layout: all bodies in one cluster blob store.
//!
//! Every body is framed as
//!
//! ```text
//! "\n\nFrom -\n" <message bytes> "\n\nFrom *\n"
//! ```
//!
//! so a damaged data file can still be scanned for message boundaries.
//! Locations record the unframed message length; the blob allocation is
//! `length + 2 * SEPARATOR_LEN` bytes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::{
    compact_name, copy_index, discard, index_refs, keep_going, read_exact_from, read_record_from,
    rebuild_index, swap_in, CheckInput, CheckResult, IndexSource, Layout, MessageStore, Progress,
    SalvagedMessage, StoreStats, INDEX_STORE,
};
use crate::blob::{BlobStore, ClusterStorage};
use crate::error::{Result, StoreError};
use crate::model::mail::StoredMessageLocation;
use crate::parser::header::MessageHeader;
use crate::parser::message::Message;
use crate::store::record;

/// Separator written before every body.
pub const USED_SEPARATOR: &[u8; 9] = b"\n\nFrom -\n";

/// Separator written after every body.
pub const UNUSED_SEPARATOR: &[u8; 9] = b"\n\nFrom *\n";

/// Length of each separator.
pub const SEPARATOR_LEN: u32 = 9;

/// Base name of the body blob store.
pub const BODY_STORE: &str = "msg";

struct Inner {
    bodies: Box<dyn BlobStore>,
    index: Box<dyn BlobStore>,
}

/// Message store keeping all bodies in one framed blob file.
pub struct SingleFileStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl SingleFileStore {
    /// Open `<dir>/msg.{box,map}` and `<dir>/index.{box,map}`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let bodies = ClusterStorage::open(dir, BODY_STORE)?;
        let index = ClusterStorage::open(dir, INDEX_STORE)?;
        debug!(dir = %dir.display(), "Opened single-file store");
        Ok(Self::with_blob_stores(dir, Box::new(bodies), Box::new(index)))
    }

    /// Build a store over caller-provided blob stores.
    pub fn with_blob_stores(
        dir: impl AsRef<Path>,
        bodies: Box<dyn BlobStore>,
        index: Box<dyn BlobStore>,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            inner: Mutex::new(Inner { bodies, index }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn framed_len(length: u32) -> Result<u32> {
    length
        .checked_add(2 * SEPARATOR_LEN)
        .ok_or(StoreError::Unsupported("messages over 4 GiB"))
}

fn unframe(offset: u32, length: u32, data: Vec<u8>) -> Result<Vec<u8>> {
    let expected = length + 2 * SEPARATOR_LEN;
    if data.len() != expected as usize {
        return Err(StoreError::ShortRead {
            key: offset,
            expected,
            actual: data.len() as u32,
        });
    }
    let sep = SEPARATOR_LEN as usize;
    if !data.starts_with(USED_SEPARATOR) || !data.ends_with(UNUSED_SEPARATOR) {
        return Err(StoreError::CorruptFrame { offset });
    }
    Ok(data[sep..data.len() - sep].to_vec())
}

fn load_body(bodies: &mut dyn BlobStore, offset: u32, length: u32) -> Result<Vec<u8>> {
    let data = bodies.load(offset, framed_len(length)?)?;
    unframe(offset, length, data)
}

impl MessageStore for SingleFileStore {
    fn layout(&self) -> Layout {
        Layout::Single
    }

    fn save(
        &self,
        message: &Message,
        label: &str,
        index_only: bool,
    ) -> Result<StoredMessageLocation> {
        let length = u32::try_from(message.len())
            .map_err(|_| StoreError::Unsupported("messages over 4 GiB"))?;
        framed_len(length)?;
        let data = record::build(&message.header(), label);
        let mut inner = self.lock();

        let mut location = StoredMessageLocation::absent();
        if !index_only {
            location.offset = inner
                .bodies
                .save(&[USED_SEPARATOR, message.as_bytes(), UNUSED_SEPARATOR])?;
            location.length = length;
            location.header_length = message.header_length() as u32;
        }

        match inner.index.save(&[&data]) {
            Ok(key) => {
                location.index_key = key;
                location.index_length = data.len() as u32;
            }
            Err(e) => {
                if location.has_body() {
                    let offset = location.offset;
                    if let Err(free_err) = inner.bodies.free(offset, length + 2 * SEPARATOR_LEN) {
                        warn!(offset, error = %free_err, "Failed to roll back body");
                    }
                }
                return Err(e);
            }
        }
        debug!(
            offset = location.offset,
            index_key = location.index_key,
            "Stored message"
        );
        Ok(location)
    }

    fn load(&self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        load_body(inner.bodies.as_mut(), offset, length)
    }

    fn free(&self, location: &StoredMessageLocation) {
        let mut inner = self.lock();
        if location.has_body() {
            let framed = location.length.saturating_add(2 * SEPARATOR_LEN);
            if let Err(e) = inner.bodies.free(location.offset, framed) {
                warn!(offset = location.offset, error = %e, "Failed to free body");
            }
        }
        if location.has_index() {
            if let Err(e) = inner.index.free(location.index_key, location.index_length) {
                warn!(index_key = location.index_key, error = %e, "Failed to free index record");
            }
        }
    }

    fn read_index(&self, key: u32, length: u32) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        read_exact_from(inner.index.as_mut(), key, length)
    }

    fn read_record(&self, key: u32) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        read_record_from(inner.index.as_mut(), key)
    }

    fn update_index(&self, old_key: u32, old_length: u32, data: &[u8]) -> Result<(u32, u32)> {
        let mut inner = self.lock();
        let key = inner.index.save(&[data])?;
        if let Err(e) = inner.index.free(old_key, old_length) {
            warn!(index_key = old_key, error = %e, "Failed to free replaced index record");
        }
        Ok((key, data.len() as u32))
    }

    fn compact(
        &self,
        locations: &[StoredMessageLocation],
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<StoredMessageLocation>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut fresh_bodies = inner.bodies.create_empty(&compact_name(BODY_STORE))?;
        let mut fresh_index = match inner.index.create_empty(&compact_name(INDEX_STORE)) {
            Ok(store) => store,
            Err(e) => {
                discard(fresh_bodies);
                return Err(e);
            }
        };

        let total = locations.len();
        let copied = locations
            .iter()
            .enumerate()
            .map(|(done, location)| {
                keep_going(progress, done, total)?;
                let mut moved = copy_index(location, inner.index.as_mut(), fresh_index.as_mut())?;
                if location.has_body() {
                    moved.offset = fresh_bodies.compact(
                        location.offset,
                        framed_len(location.length)?,
                        Some(inner.bodies.as_mut()),
                    )?;
                }
                Ok(moved)
            })
            .collect::<Result<Vec<_>>>()
            .and_then(|moved| keep_going(progress, total, total).map(|_| moved));

        let moved = match copied {
            Ok(moved) => moved,
            Err(e) => {
                discard(fresh_bodies);
                discard(fresh_index);
                return Err(e);
            }
        };

        let before = inner.bodies.allocated_bytes() + inner.index.allocated_bytes();
        swap_in(&self.dir, &mut inner.bodies, fresh_bodies)?;
        swap_in(&self.dir, &mut inner.index, fresh_index)?;
        info!(
            messages = total,
            before,
            after = inner.bodies.allocated_bytes() + inner.index.allocated_bytes(),
            "Compacted single-file store"
        );
        Ok(moved)
    }

    fn check(
        &self,
        locations: &[StoredMessageLocation],
        provider: &mut dyn FnMut(&CheckInput) -> Result<IndexSource>,
        ignore_errors: bool,
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<CheckResult>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut fresh = inner.index.create_empty(&compact_name(INDEX_STORE))?;

        let bodies = &mut inner.bodies;
        let mut body_header = |location: &StoredMessageLocation| -> Result<MessageHeader> {
            let data = load_body(bodies.as_mut(), location.offset, location.length)?;
            Ok(Message::new(data).header())
        };
        let results = rebuild_index(
            locations,
            inner.index.as_mut(),
            fresh.as_mut(),
            &mut body_header,
            provider,
            ignore_errors,
            progress,
        );

        match results {
            Ok(results) => {
                swap_in(&self.dir, &mut inner.index, fresh)?;
                let ignored = results
                    .iter()
                    .filter(|r| matches!(r, CheckResult::Ignored))
                    .count();
                info!(messages = results.len(), ignored, "Rebuilt index store");
                Ok(results)
            }
            Err(e) => {
                discard(fresh);
                Err(e)
            }
        }
    }

    fn salvage(
        &self,
        _known: &[StoredMessageLocation],
        _progress: Option<Progress<'_>>,
    ) -> Result<Vec<SalvagedMessage>> {
        Err(StoreError::Unsupported("single-file"))
    }

    fn free_unused(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.bodies.free_unused()?;
        inner.index.free_unused()
    }

    fn free_unreferenced(&self, locations: &[StoredMessageLocation]) -> Result<()> {
        let bodies = locations
            .iter()
            .filter(|l| l.has_body())
            .map(|l| Ok((l.offset, framed_len(l.length)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut inner = self.lock();
        inner.bodies.free_unreferenced(&bodies)?;
        inner.index.free_unreferenced(&index_refs(locations))
    }

    fn save_decoded(&self, _location: &StoredMessageLocation, _data: &[u8]) -> Result<()> {
        Err(StoreError::Unsupported("single-file"))
    }

    fn load_decoded(&self, _location: &StoredMessageLocation) -> Result<Option<Vec<u8>>> {
        Err(StoreError::Unsupported("single-file"))
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock();
        Ok(StoreStats {
            layout: Layout::Single,
            message_files: None,
            body_bytes: inner.bodies.allocated_bytes(),
            index_bytes: inner.index.allocated_bytes(),
        })
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.bodies.flush()?;
        inner.index.flush()
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.bodies.close()?;
        inner.index.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn memory_store() -> SingleFileStore {
        SingleFileStore::with_blob_stores(
            "unused",
            Box::new(MemoryBlobStore::new(BODY_STORE)),
            Box::new(MemoryBlobStore::new(INDEX_STORE)),
        )
    }

    const RAW: &[u8] = b"From: a@b.com\r\nSubject: Hi\r\n\r\nBody\r\n";

    #[test]
    fn test_round_trip_in_memory() {
        let store = memory_store();
        let loc = store.save(&Message::new(RAW), "inbox", false).unwrap();
        assert_eq!(loc.length, RAW.len() as u32);
        assert_eq!(store.load(loc.offset, loc.length).unwrap(), RAW);
    }

    #[test]
    fn test_index_only_has_no_body() {
        let store = memory_store();
        let loc = store.save(&Message::new(RAW), "", true).unwrap();
        assert!(!loc.has_body());
        assert!(loc.has_index());
        assert_eq!(store.stats().unwrap().body_bytes, 0);
    }

    #[test]
    fn test_short_length_is_rejected() {
        let store = memory_store();
        let loc = store.save(&Message::new(RAW), "", false).unwrap();
        assert!(store.load(loc.offset, loc.length + 5).is_err());
        assert!(matches!(
            store.load(loc.offset, loc.length - 1),
            Err(StoreError::CorruptFrame { .. })
        ));
    }

    #[test]
    fn test_update_index_frees_old() {
        let store = memory_store();
        let loc = store.save(&Message::new(RAW), "", true).unwrap();
        let (key, len) = store
            .update_index(loc.index_key, loc.index_length, b"new record")
            .unwrap();
        assert_ne!(key, loc.index_key);
        assert_eq!(len, 10);
        assert!(store.read_index(loc.index_key, loc.index_length).is_err());
        assert_eq!(store.read_index(key, len).unwrap(), b"new record");
    }

    #[test]
    fn test_salvage_unsupported() {
        let store = memory_store();
        assert!(matches!(
            store.salvage(&[], None),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_unframe_checks_separators() {
        let mut data = Vec::new();
        data.extend_from_slice(USED_SEPARATOR);
        data.extend_from_slice(b"abc");
        data.extend_from_slice(USED_SEPARATOR);
        assert!(matches!(
            unframe(4, 3, data),
            Err(StoreError::CorruptFrame { offset: 4 })
        ));
    }
}
