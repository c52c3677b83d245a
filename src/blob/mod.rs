//! Keyed, offset-addressed blob storage.
//!
//! A blob store hands out a `u32` key for every saved record and needs the
//! record length back on every load/free, so it never has to store per-record
//! metadata. Two implementations exist:
//!
//! - [`cluster::ClusterStorage`]: a data file addressed in fixed clusters plus
//!   an allocation bitmap, the on-disk primitive used by the message stores.
//! - [`memory::MemoryBlobStore`]: an in-process map, for tests and throwaway stores.

pub mod cluster;
pub mod memory;

use std::path::Path;

use crate::error::Result;

pub use cluster::ClusterStorage;
pub use memory::MemoryBlobStore;

/// Suffix of the temporary base name used while a store is being rewritten.
pub const COMPACT_SUFFIX: &str = ".compact";

/// Append/free/compact storage for opaque records.
pub trait BlobStore: Send {
    /// Base name of the store (file stem for file-backed stores).
    fn name(&self) -> &str;

    /// Save the concatenation of `pieces` as one record and return its key.
    fn save(&mut self, pieces: &[&[u8]]) -> Result<u32>;

    /// Load up to `length` bytes of the record at `key`.
    ///
    /// The result may be shorter than `length` if the store ends early;
    /// callers that need an exact size must check.
    fn load(&mut self, key: u32, length: u32) -> Result<Vec<u8>>;

    /// Release the record at `key`.
    fn free(&mut self, key: u32, length: u32) -> Result<()>;

    /// Rewrite a record and return its new key.
    ///
    /// With `source`, the record is copied out of `source` into this store.
    /// Without it, the record is moved inside this store to a lower free
    /// region if one exists (the old key is returned otherwise).
    fn compact(
        &mut self,
        key: u32,
        length: u32,
        source: Option<&mut dyn BlobStore>,
    ) -> Result<u32>;

    /// Mark everything not covered by `refs` (`(key, length)` pairs) as free.
    fn free_unreferenced(&mut self, refs: &[(u32, u32)]) -> Result<()>;

    /// Give trailing free space back to the filesystem.
    fn free_unused(&mut self) -> Result<()>;

    /// Persist allocation state and data.
    fn flush(&mut self) -> Result<()>;

    /// Flush and release open handles. The store reopens lazily on next use.
    fn close(&mut self) -> Result<()>;

    /// Move the store to `dir` under a new base name.
    fn rename(&mut self, dir: &Path, base_name: &str) -> Result<()>;

    /// Create an empty store of the same kind next to this one.
    fn create_empty(&self, base_name: &str) -> Result<Box<dyn BlobStore>>;

    /// Delete the store and its backing files.
    fn remove(self: Box<Self>) -> Result<()>;

    /// Bytes currently allocated to live records.
    fn allocated_bytes(&self) -> u64;
}
