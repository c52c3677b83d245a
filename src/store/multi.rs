//! Multi-file layout: one file per body.
//!
//! ```text
//! <dir>/msg/00000000/00000001.msg
//! <dir>/msg/00000000/00000001.d.msg   (optional decoded rendition)
//! <dir>/msg/00000001/00001000.msg
//! <dir>/index.box, <dir>/index.map
//! ```
//!
//! Offsets are a counter, 1000 files per bucket directory. The counter is
//! recovered at open time from the highest bucket and its highest file.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
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

/// Directory holding the message buckets.
pub const MESSAGE_DIR: &str = "msg";

/// Number of message files per bucket directory.
pub const FILES_PER_BUCKET: u32 = 1000;

const MESSAGE_EXT: &str = ".msg";
const DECODED_EXT: &str = ".d.msg";

struct Inner {
    index: Box<dyn BlobStore>,
    next_offset: u32,
    known_dirs: HashSet<u32>,
}

/// Message store keeping every body in its own file.
pub struct MultiFileStore {
    dir: PathBuf,
    msg_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl MultiFileStore {
    /// Open `<dir>/msg/` and `<dir>/index.{box,map}`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let index = ClusterStorage::open(dir, INDEX_STORE)?;
        Self::with_index_store(dir, Box::new(index))
    }

    /// Build a store over a caller-provided index blob store.
    pub fn with_index_store(dir: impl AsRef<Path>, index: Box<dyn BlobStore>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let msg_dir = dir.join(MESSAGE_DIR);
        let next_offset = next_offset(&msg_dir)?;
        debug!(dir = %dir.display(), next_offset, "Opened multi-file store");
        Ok(Self {
            dir,
            msg_dir,
            inner: Mutex::new(Inner {
                index,
                next_offset,
                known_dirs: HashSet::new(),
            }),
        })
    }

    /// Path of the body file for `offset`.
    pub fn message_path(&self, offset: u32) -> PathBuf {
        file_path(&self.msg_dir, offset, MESSAGE_EXT)
    }

    /// Path of the decoded rendition for `offset`.
    pub fn decoded_path(&self, offset: u32) -> PathBuf {
        file_path(&self.msg_dir, offset, DECODED_EXT)
    }

    /// The offset the next stored body will get.
    pub fn peek_next_offset(&self) -> u32 {
        self.lock().next_offset
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a body to a new file, skipping offsets already taken on disk.
    fn write_body(&self, inner: &mut Inner, bytes: &[u8]) -> Result<(u32, PathBuf)> {
        loop {
            let offset = inner.next_offset;
            if offset == crate::model::mail::ABSENT {
                return Err(StoreError::Unsupported("more than 2^32 - 1 message files"));
            }
            let bucket = offset / FILES_PER_BUCKET;
            let bucket_dir = self.msg_dir.join(format!("{bucket:08}"));
            if !inner.known_dirs.contains(&bucket) {
                fs::create_dir_all(&bucket_dir).map_err(|e| StoreError::io(&bucket_dir, e))?;
                inner.known_dirs.insert(bucket);
            }
            inner.next_offset = offset + 1;

            let path = self.message_path(offset);
            let file = OpenOptions::new().write(true).create_new(true).open(&path);
            let mut file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "Message file already exists, skipping offset");
                    continue;
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_data()) {
                drop(file);
                remove_quietly(&path);
                return Err(StoreError::io(&path, e));
            }
            return Ok((offset, path));
        }
    }

    fn read_body(&self, offset: u32, length: u32) -> Result<Vec<u8>> {
        let path = self.message_path(offset);
        let data = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        if data.len() != length as usize {
            return Err(StoreError::ShortRead {
                key: offset,
                expected: length,
                actual: data.len() as u32,
            });
        }
        Ok(data)
    }
}

fn file_path(msg_dir: &Path, offset: u32, ext: &str) -> PathBuf {
    msg_dir
        .join(format!("{:08}", offset / FILES_PER_BUCKET))
        .join(format!("{offset:08}{ext}"))
}

fn parse_number(name: &str) -> Option<u32> {
    if name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

fn parse_message_name(name: &str) -> Option<u32> {
    if name.ends_with(DECODED_EXT) {
        return None;
    }
    name.strip_suffix(MESSAGE_EXT).and_then(parse_number)
}

fn entries_of(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    Ok(out)
}

/// Bucket numbers present under `msg_dir`, ascending.
fn buckets(msg_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut buckets: Vec<_> = entries_of(msg_dir)?
        .into_iter()
        .filter(|(_, path)| path.is_dir())
        .filter_map(|(name, path)| parse_number(&name).map(|n| (n, path)))
        .collect();
    buckets.sort_unstable_by_key(|(n, _)| *n);
    Ok(buckets)
}

/// Body files inside one bucket, ascending by offset.
fn message_files(bucket_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files: Vec<_> = entries_of(bucket_dir)?
        .into_iter()
        .filter_map(|(name, path)| parse_message_name(&name).map(|n| (n, path)))
        .collect();
    files.sort_unstable_by_key(|(n, _)| *n);
    Ok(files)
}

fn all_message_files(msg_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    for (_, bucket_dir) in buckets(msg_dir)? {
        files.extend(message_files(&bucket_dir)?);
    }
    Ok(files)
}

/// Offset for the next body: one past the highest file in the highest
/// bucket, or one past the bucket's first offset when it is empty.
pub fn next_offset(msg_dir: &Path) -> Result<u32> {
    let Some((bucket, bucket_dir)) = buckets(msg_dir)?.pop() else {
        return Ok(1);
    };
    let base = bucket.saturating_mul(FILES_PER_BUCKET);
    let highest = message_files(&bucket_dir)?
        .last()
        .map_or(base, |(n, _)| (*n).max(base));
    Ok(highest.saturating_add(1))
}

/// Index an orphan body file.
fn recover_file(index: &mut dyn BlobStore, offset: u32, path: &Path) -> Result<SalvagedMessage> {
    let data = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let length =
        u32::try_from(data.len()).map_err(|_| StoreError::Unsupported("messages over 4 GiB"))?;
    let message = Message::new(data);
    let record = record::build(&message.header(), "");
    let index_key = index.save(&[&record])?;
    Ok(SalvagedMessage {
        location: StoredMessageLocation {
            offset,
            length,
            header_length: message.header_length() as u32,
            index_key,
            index_length: record.len() as u32,
        },
        message,
    })
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

impl MessageStore for MultiFileStore {
    fn layout(&self) -> Layout {
        Layout::Multi
    }

    fn save(
        &self,
        message: &Message,
        label: &str,
        index_only: bool,
    ) -> Result<StoredMessageLocation> {
        let length = u32::try_from(message.len())
            .map_err(|_| StoreError::Unsupported("messages over 4 GiB"))?;
        let data = record::build(&message.header(), label);
        let mut inner = self.lock();

        let mut location = StoredMessageLocation::absent();
        let mut written = None;
        if !index_only {
            let (offset, path) = self.write_body(&mut inner, message.as_bytes())?;
            location.offset = offset;
            location.length = length;
            location.header_length = message.header_length() as u32;
            written = Some(path);
        }

        match inner.index.save(&[&data]) {
            Ok(key) => {
                location.index_key = key;
                location.index_length = data.len() as u32;
            }
            Err(e) => {
                if let Some(path) = written {
                    remove_quietly(&path);
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
        let _inner = self.lock();
        self.read_body(offset, length)
    }

    fn free(&self, location: &StoredMessageLocation) {
        let mut inner = self.lock();
        if location.has_body() {
            remove_quietly(&self.message_path(location.offset));
            remove_quietly(&self.decoded_path(location.offset));
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
        let mut fresh = inner.index.create_empty(&compact_name(INDEX_STORE))?;

        let total = locations.len();
        let copied = locations
            .iter()
            .enumerate()
            .map(|(done, location)| {
                keep_going(progress, done, total)?;
                copy_index(location, inner.index.as_mut(), fresh.as_mut())
            })
            .collect::<Result<Vec<_>>>()
            .and_then(|moved| keep_going(progress, total, total).map(|_| moved));

        match copied {
            Ok(moved) => {
                let before = inner.index.allocated_bytes();
                swap_in(&self.dir, &mut inner.index, fresh)?;
                info!(
                    messages = total,
                    before,
                    after = inner.index.allocated_bytes(),
                    "Compacted index store"
                );
                Ok(moved)
            }
            Err(e) => {
                discard(fresh);
                Err(e)
            }
        }
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

        let mut body_header = |location: &StoredMessageLocation| -> Result<MessageHeader> {
            let data = self.read_body(location.offset, location.length)?;
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
        known: &[StoredMessageLocation],
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<SalvagedMessage>> {
        let known: HashSet<u32> = known
            .iter()
            .filter(|l| l.has_body())
            .map(|l| l.offset)
            .collect();
        let mut inner = self.lock();
        let orphans: Vec<_> = all_message_files(&self.msg_dir)?
            .into_iter()
            .filter(|(offset, _)| !known.contains(offset))
            .collect();

        let total = orphans.len();
        let mut salvaged: Vec<SalvagedMessage> = Vec::with_capacity(total);
        for (done, (offset, path)) in orphans.iter().enumerate() {
            let recovered = keep_going(progress, done, total)
                .and_then(|_| recover_file(inner.index.as_mut(), *offset, path));
            match recovered {
                Ok(message) => salvaged.push(message),
                Err(e) => {
                    for message in &salvaged {
                        let loc = message.location;
                        if let Err(free_err) = inner.index.free(loc.index_key, loc.index_length) {
                            warn!(index_key = loc.index_key, error = %free_err, "Failed to roll back salvage");
                        }
                    }
                    return Err(e);
                }
            }
        }
        keep_going(progress, total, total)?;
        info!(recovered = salvaged.len(), "Salvaged orphan message files");
        Ok(salvaged)
    }

    fn free_unused(&self) -> Result<()> {
        self.lock().index.free_unused()
    }

    fn free_unreferenced(&self, locations: &[StoredMessageLocation]) -> Result<()> {
        self.lock().index.free_unreferenced(&index_refs(locations))
    }

    fn save_decoded(&self, location: &StoredMessageLocation, data: &[u8]) -> Result<()> {
        if !location.has_body() {
            return Err(StoreError::NoBody);
        }
        let _inner = self.lock();
        let path = self.decoded_path(location.offset);
        let file = OpenOptions::new().write(true).create_new(true).open(&path);
        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Decoded message already stored");
                return Ok(());
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if let Err(e) = file.write_all(data) {
            drop(file);
            remove_quietly(&path);
            return Err(StoreError::io(&path, e));
        }
        Ok(())
    }

    fn load_decoded(&self, location: &StoredMessageLocation) -> Result<Option<Vec<u8>>> {
        if !location.has_body() {
            return Err(StoreError::NoBody);
        }
        let _inner = self.lock();
        let path = self.decoded_path(location.offset);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock();
        let files = all_message_files(&self.msg_dir)?;
        let mut body_bytes = 0;
        for (_, path) in &files {
            body_bytes += fs::metadata(path)
                .map_err(|e| StoreError::io(path, e))?
                .len();
        }
        Ok(StoreStats {
            layout: Layout::Multi,
            message_files: Some(files.len()),
            body_bytes,
            index_bytes: inner.index.allocated_bytes(),
        })
    }

    fn flush(&self) -> Result<()> {
        self.lock().index.flush()
    }

    fn close(&self) -> Result<()> {
        self.lock().index.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let msg_dir = Path::new("/s/msg");
        assert_eq!(
            file_path(msg_dir, 1234, MESSAGE_EXT),
            Path::new("/s/msg/00000001/00001234.msg")
        );
        assert_eq!(
            file_path(msg_dir, 7, DECODED_EXT),
            Path::new("/s/msg/00000000/00000007.d.msg")
        );
    }

    #[test]
    fn test_parse_message_name() {
        assert_eq!(parse_message_name("00000042.msg"), Some(42));
        assert_eq!(parse_message_name("00000042.d.msg"), None);
        assert_eq!(parse_message_name("42.msg"), None);
        assert_eq!(parse_message_name("0000004x.msg"), None);
    }

    #[test]
    fn test_next_offset_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_offset(&dir.path().join(MESSAGE_DIR)).unwrap(), 1);
    }

    #[test]
    fn test_next_offset_from_highest_file() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("00000001");
        fs::create_dir_all(&bucket).unwrap();
        fs::write(bucket.join("00001005.msg"), b"x").unwrap();
        fs::write(bucket.join("00001017.d.msg"), b"x").unwrap();
        assert_eq!(next_offset(dir.path()).unwrap(), 1006);
    }

    #[test]
    fn test_decoded_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MultiFileStore::open(dir.path()).unwrap();
        let loc = store
            .save(&Message::new(&b"Subject: x\n\nbody\n"[..]), "", false)
            .unwrap();
        store.save_decoded(&loc, b"first").unwrap();
        store.save_decoded(&loc, b"second").unwrap();
        assert_eq!(store.load_decoded(&loc).unwrap().unwrap(), b"first");
    }
}
