//! Message stores: durable bodies plus their index records.
//!
//! Two layouts share one contract ([`MessageStore`]):
//!
//! - [`single::SingleFileStore`]: every body lives in one cluster blob file,
//!   framed by separators.
//! - [`multi::MultiFileStore`]: every body is its own file under
//!   `msg/<bucket>/<offset>.msg`.
//!
//! Both keep index records in a separate blob store and own one mutex that
//! serializes all blob I/O.

pub mod multi;
pub mod record;
pub mod single;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blob::{BlobStore, COMPACT_SUFFIX};
use crate::error::{Result, StoreError};
use crate::model::mail::StoredMessageLocation;
use crate::parser::header::MessageHeader;
use crate::parser::message::Message;
use crate::store::record::IndexRecord;

pub use multi::MultiFileStore;
pub use single::SingleFileStore;

/// Base name of the index blob store.
pub const INDEX_STORE: &str = "index";

/// Progress callback: `(done, total)`. Returning `false` cancels.
pub type Progress<'a> = &'a dyn Fn(usize, usize) -> bool;

/// How message bodies are laid out on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// All bodies in one blob file.
    Single,
    /// One file per body.
    #[default]
    Multi,
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Multi => write!(f, "multi"),
        }
    }
}

/// What `check` knows about one message when asking for its summary.
#[derive(Debug)]
pub struct CheckInput {
    /// Position of the message in the checked list.
    pub position: usize,
    pub location: StoredMessageLocation,
    /// Header re-read from the stored body, if the message has one.
    pub header: Option<MessageHeader>,
    /// The index record the message had before the check, if readable.
    pub previous: Option<IndexRecord>,
}

/// Summary source for rebuilding one index record.
#[derive(Debug, Clone)]
pub struct IndexSource {
    pub header: MessageHeader,
    pub label: String,
}

/// Per-message outcome of a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// A fresh index record was written.
    Rebuilt { index_key: u32, index_length: u32 },
    /// The message could not be re-indexed and should be dropped by the caller.
    Ignored,
}

/// A message file found on disk that no known location referenced.
#[derive(Debug, Clone)]
pub struct SalvagedMessage {
    pub location: StoredMessageLocation,
    pub message: Message,
}

/// Storage usage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub layout: Layout,
    /// Number of body files (multi-file layout only).
    pub message_files: Option<usize>,
    /// Bytes allocated to bodies.
    pub body_bytes: u64,
    /// Bytes allocated to index records.
    pub index_bytes: u64,
}

/// Durable storage of message bodies and index records.
pub trait MessageStore: Send + Sync {
    fn layout(&self) -> Layout;

    /// Store a message and its index record.
    ///
    /// The index record is always written; the body only when `index_only`
    /// is false. On failure nothing stays allocated.
    fn save(
        &self,
        message: &Message,
        label: &str,
        index_only: bool,
    ) -> Result<StoredMessageLocation>;

    /// Load exactly `length` body bytes stored at `offset`.
    fn load(&self, offset: u32, length: u32) -> Result<Vec<u8>>;

    /// Release body and index record. Absent slots are skipped and failures
    /// are logged, never returned.
    fn free(&self, location: &StoredMessageLocation);

    /// Read an index record of known length.
    fn read_index(&self, key: u32, length: u32) -> Result<Vec<u8>>;

    /// Read an index record using the size stored in its prefix.
    fn read_record(&self, key: u32) -> Result<Vec<u8>>;

    /// Write `record` as a new index record, then free the old one.
    fn update_index(&self, old_key: u32, old_length: u32, record: &[u8]) -> Result<(u32, u32)>;

    /// Rewrite the given locations into fresh storage, in order.
    ///
    /// Returns the new locations, position for position. A cancelled or
    /// failed compaction leaves the store untouched.
    fn compact(
        &self,
        locations: &[StoredMessageLocation],
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<StoredMessageLocation>>;

    /// Rebuild the index store from scratch.
    ///
    /// `provider` supplies the summary of every message. When it fails,
    /// the message is reported as [`CheckResult::Ignored`] if
    /// `ignore_errors` is set; otherwise the pass aborts with the store
    /// untouched.
    fn check(
        &self,
        locations: &[StoredMessageLocation],
        provider: &mut dyn FnMut(&CheckInput) -> Result<IndexSource>,
        ignore_errors: bool,
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<CheckResult>>;

    /// Recover body files that no known location references.
    fn salvage(
        &self,
        known: &[StoredMessageLocation],
        progress: Option<Progress<'_>>,
    ) -> Result<Vec<SalvagedMessage>>;

    /// Give unused trailing storage back to the filesystem.
    fn free_unused(&self) -> Result<()>;

    /// Free every allocation not covered by `locations`.
    fn free_unreferenced(&self, locations: &[StoredMessageLocation]) -> Result<()>;

    /// Store a decoded rendition next to a body. A second write is a no-op.
    fn save_decoded(&self, location: &StoredMessageLocation, data: &[u8]) -> Result<()>;

    /// Load the decoded rendition of a body, if one was saved.
    fn load_decoded(&self, location: &StoredMessageLocation) -> Result<Option<Vec<u8>>>;

    fn stats(&self) -> Result<StoreStats>;

    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Open the store in `dir` with the given layout.
pub fn open_store(dir: impl AsRef<Path>, layout: Layout) -> Result<Box<dyn MessageStore>> {
    Ok(match layout {
        Layout::Single => Box::new(SingleFileStore::open(dir)?),
        Layout::Multi => Box::new(MultiFileStore::open(dir)?),
    })
}

/// Summary used by `check` when the caller has no better source: the
/// stored header when there is a body, else the previous index record.
pub fn default_index_source(input: &CheckInput) -> Result<IndexSource> {
    let label = input
        .previous
        .as_ref()
        .map(|r| r.get(crate::model::field::IndexField::Label).to_string())
        .unwrap_or_default();
    if let Some(header) = &input.header {
        return Ok(IndexSource {
            header: header.clone(),
            label,
        });
    }
    match &input.previous {
        Some(previous) => Ok(IndexSource {
            header: previous.to_header(),
            label,
        }),
        None => Err(StoreError::HeaderUnreadable {
            position: input.position,
            reason: "no body and no readable index record".into(),
        }),
    }
}

/// Ask the progress callback whether to continue.
pub(crate) fn keep_going(progress: Option<Progress<'_>>, done: usize, total: usize) -> Result<()> {
    match progress {
        Some(callback) if !callback(done, total) => Err(StoreError::Cancelled),
        _ => Ok(()),
    }
}

/// Temporary base name for the rewritten copy of `base`.
pub(crate) fn compact_name(base: &str) -> String {
    format!("{base}{COMPACT_SUFFIX}")
}

/// Replace `slot` with `fresh` and give it the old store's name.
pub(crate) fn swap_in(
    dir: &Path,
    slot: &mut Box<dyn BlobStore>,
    mut fresh: Box<dyn BlobStore>,
) -> Result<()> {
    let base = slot.name().to_string();
    fresh.flush()?;
    let old = std::mem::replace(slot, fresh);
    old.remove()?;
    slot.rename(dir, &base)
}

/// Remove a store that will not be swapped in.
pub(crate) fn discard(store: Box<dyn BlobStore>) {
    let name = store.name().to_string();
    if let Err(e) = store.remove() {
        warn!(store = %name, error = %e, "Failed to remove abandoned store");
    }
}

/// Read a self-sized index record from `index`.
pub(crate) fn read_record_from(index: &mut dyn BlobStore, key: u32) -> Result<Vec<u8>> {
    let prefix = index.load(key, record::PREFIX_LEN as u32)?;
    let length = record::record_len(&prefix).ok_or_else(|| StoreError::InvalidRecord {
        key,
        reason: format!("record prefix is {} bytes", prefix.len()),
    })?;
    read_exact_from(index, key, length)
}

/// Treat a truncated or unframed record as an empty one.
///
/// Summary lookups read damaged records as empty fields; I/O failures
/// still propagate.
pub(crate) fn or_empty_record(key: u32, read: Result<Vec<u8>>) -> Result<Vec<u8>> {
    match read {
        Err(e @ (StoreError::ShortRead { .. } | StoreError::InvalidRecord { .. })) => {
            warn!(key, error = %e, "Unreadable index record, using empty fields");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Load exactly `length` bytes from `store`.
pub(crate) fn read_exact_from(store: &mut dyn BlobStore, key: u32, length: u32) -> Result<Vec<u8>> {
    let data = store.load(key, length)?;
    if data.len() != length as usize {
        return Err(StoreError::ShortRead {
            key,
            expected: length,
            actual: data.len() as u32,
        });
    }
    Ok(data)
}

/// Rebuild every index record of `locations` into `fresh`.
///
/// `old_index` is read for the previous records; `body_header` re-reads the
/// header of a message with a body.
pub(crate) fn rebuild_index(
    locations: &[StoredMessageLocation],
    old_index: &mut dyn BlobStore,
    fresh: &mut dyn BlobStore,
    body_header: &mut dyn FnMut(&StoredMessageLocation) -> Result<MessageHeader>,
    provider: &mut dyn FnMut(&CheckInput) -> Result<IndexSource>,
    ignore_errors: bool,
    progress: Option<Progress<'_>>,
) -> Result<Vec<CheckResult>> {
    let total = locations.len();
    let mut results = Vec::with_capacity(total);
    for (position, location) in locations.iter().enumerate() {
        keep_going(progress, position, total)?;

        let previous = if location.has_index() {
            read_exact_from(old_index, location.index_key, location.index_length)
                .map(|data| IndexRecord::parse(record::split(&data).0))
                .ok()
        } else {
            None
        };

        let source = match location.has_body() {
            true => body_header(location).map(Some),
            false => Ok(None),
        }
        .and_then(|header| {
            provider(&CheckInput {
                position,
                location: *location,
                header,
                previous,
            })
        });

        match source {
            Ok(source) => {
                let data = record::build(&source.header, &source.label);
                let index_key = fresh.save(&[&data])?;
                results.push(CheckResult::Rebuilt {
                    index_key,
                    index_length: data.len() as u32,
                });
            }
            Err(e) if ignore_errors => {
                warn!(position, error = %e, "Ignoring message that failed the check");
                results.push(CheckResult::Ignored);
            }
            Err(e @ StoreError::HeaderUnreadable { .. }) => return Err(e),
            Err(e) => {
                return Err(StoreError::HeaderUnreadable {
                    position,
                    reason: e.to_string(),
                });
            }
        }
    }
    keep_going(progress, total, total)?;
    Ok(results)
}

/// Copy the index record of `location` into `fresh`.
pub(crate) fn copy_index(
    location: &StoredMessageLocation,
    old_index: &mut dyn BlobStore,
    fresh: &mut dyn BlobStore,
) -> Result<StoredMessageLocation> {
    let mut moved = *location;
    if location.has_index() {
        moved.index_key = fresh.compact(location.index_key, location.index_length, Some(old_index))?;
    }
    Ok(moved)
}

/// Index allocations referenced by `locations`.
pub(crate) fn index_refs(locations: &[StoredMessageLocation]) -> Vec<(u32, u32)> {
    locations
        .iter()
        .filter(|l| l.has_index())
        .map(|l| (l.index_key, l.index_length))
        .collect()
}
