//! Account: one store directory with its folder, index and cache.
//!
//! The account owns every [`MessageHandle`](crate::model::mail::MessageHandle)
//! and is the only caller that frees locations, so each location is released
//! exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::MessageCache;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::folder::Folder;
use crate::index::MessageIndex;
use crate::model::field::{CacheField, IndexField};
use crate::model::mail::{MessageHandle, StoredMessageLocation, ABSENT};
use crate::parser::message::Message;
use crate::store::{
    self, CheckInput, CheckResult, IndexSource, Layout, MessageStore, Progress, StoreStats,
};

/// Outcome of [`Account::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    /// Messages whose index record was rebuilt.
    pub rebuilt: usize,
    /// Messages dropped from the folder because they could not be re-indexed.
    pub removed: Vec<u64>,
}

/// Folder and storage figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub messages: usize,
    /// Messages stored without a body.
    pub index_only: usize,
    pub store: StoreStats,
}

/// A message store wired to its folder, index and cache.
pub struct Account {
    dir: PathBuf,
    store: Arc<dyn MessageStore>,
    index: MessageIndex,
    cache: MessageCache,
    folder: Folder,
}

impl Account {
    /// Open the account in `dir`, creating it if needed.
    ///
    /// An existing folder decides the layout; a new one uses `layout`.
    pub fn open(dir: impl AsRef<Path>, layout: Layout, config: &Config) -> Result<Self> {
        let dir = dir.as_ref();
        let folder = match Folder::load(Folder::path_in(dir))? {
            Some(folder) => folder,
            None => Folder::new(Folder::path_in(dir), layout),
        };
        let store: Arc<dyn MessageStore> = Arc::from(store::open_store(dir, folder.layout())?);
        Ok(Self::with_store(dir, folder, store, config))
    }

    /// Assemble an account from an already opened store.
    pub fn with_store(
        dir: impl AsRef<Path>,
        folder: Folder,
        store: Arc<dyn MessageStore>,
        config: &Config,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            index: MessageIndex::new(Arc::clone(&store), config.cache.index_max_entries),
            cache: MessageCache::new(Arc::clone(&store), config.cache.cache_max_entries),
            store,
            folder,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> Layout {
        self.store.layout()
    }

    pub fn messages(&self) -> &[MessageHandle] {
        self.folder.messages()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    fn handle(&self, id: u64) -> Result<&MessageHandle> {
        self.folder.get(id).ok_or(StoreError::MessageNotFound(id))
    }

    fn location(&self, id: u64) -> Result<StoredMessageLocation> {
        self.handle(id).map(|h| h.location)
    }

    fn forget_cached(&mut self, location: &StoredMessageLocation) {
        if location.has_index() {
            self.index.remove(location.index_key);
            self.cache.remove_data(location.index_key);
        }
    }

    /// Store a message and add it to the folder.
    pub fn store_message(&mut self, message: &Message, label: &str, index_only: bool) -> Result<u64> {
        let location = self.store.save(message, label, index_only)?;
        Ok(self.folder.push(location, 0))
    }

    /// Replace the stored message `id` with `message`, keeping its label.
    pub fn update_message(&mut self, id: u64, message: &Message) -> Result<()> {
        let old = self.location(id)?;
        let label = self.label_of(&old)?;
        let new = self.store.save(message, &label, false)?;
        if let Some(handle) = self.folder.get_mut(id) {
            handle.location = new;
        }
        self.forget_cached(&old);
        self.store.free(&old);
        Ok(())
    }

    fn label_of(&mut self, location: &StoredMessageLocation) -> Result<String> {
        if !location.has_index() {
            return Ok(String::new());
        }
        self.index
            .get(location.index_key, location.index_length, IndexField::Label)
    }

    /// Load the full message `id`.
    pub fn load_message(&self, id: u64) -> Result<Message> {
        let location = self.location(id)?;
        if !location.has_body() {
            return Err(StoreError::NoBody);
        }
        let data = self.store.load(location.offset, location.length)?;
        Ok(Message::new(data))
    }

    /// A raw summary field of message `id`.
    pub fn get_index(&mut self, id: u64, field: IndexField) -> Result<String> {
        let location = self.location(id)?;
        if !location.has_index() {
            return Ok(String::new());
        }
        self.index
            .get(location.index_key, location.index_length, field)
    }

    /// A decoded display field of message `id`.
    pub fn get_data(&self, id: u64, field: CacheField) -> Result<String> {
        let location = self.location(id)?;
        if !location.has_index() {
            return Ok(String::new());
        }
        self.cache.get_data(location.index_key, field)
    }

    /// Rewrite one field of the index record of message `id`.
    pub fn replace_index_field(&mut self, id: u64, field: IndexField, value: &str) -> Result<()> {
        let location = self.location(id)?;
        if !location.has_index() {
            return Err(StoreError::InvalidRecord {
                key: ABSENT,
                reason: format!("message {id} has no index record"),
            });
        }
        let data = self.index.create_replaced_index(
            location.index_key,
            location.index_length,
            field,
            value,
        )?;
        let (index_key, index_length) =
            self.store
                .update_index(location.index_key, location.index_length, &data)?;
        self.forget_cached(&location);
        if let Some(handle) = self.folder.get_mut(id) {
            handle.location.index_key = index_key;
            handle.location.index_length = index_length;
        }
        Ok(())
    }

    pub fn set_label(&mut self, id: u64, label: &str) -> Result<()> {
        self.replace_index_field(id, IndexField::Label, label)
    }

    /// Replace the caller-defined flag bits of message `id`.
    pub fn set_flags(&mut self, id: u64, flags: u32) -> Result<()> {
        let handle = self
            .folder
            .get_mut(id)
            .ok_or(StoreError::MessageNotFound(id))?;
        handle.flags = flags;
        Ok(())
    }

    /// Remove message `id` and free its storage.
    pub fn delete_message(&mut self, id: u64) -> Result<()> {
        let handle = self
            .folder
            .remove(id)
            .ok_or(StoreError::MessageNotFound(id))?;
        self.forget_cached(&handle.location);
        self.store.free(&handle.location);
        Ok(())
    }

    /// Drop the body of message `id`, keeping it as an index-only message.
    pub fn demote_message(&mut self, id: u64) -> Result<()> {
        let location = self.location(id)?;
        if !location.has_body() {
            return Ok(());
        }
        let body = StoredMessageLocation {
            index_key: ABSENT,
            index_length: 0,
            ..location
        };
        if let Some(handle) = self.folder.get_mut(id) {
            handle.location = location.without_body();
        }
        self.store.free(&body);
        Ok(())
    }

    /// Forget every cached index record and decoded entry.
    pub fn delete_messages_cache(&mut self) {
        self.index.clear();
        self.cache.clear();
    }

    /// Rewrite all storage in folder order and remap every location.
    ///
    /// Not crash-atomic. The single-file layout swaps its body store and
    /// then its index store, and the folder is written only after both. A
    /// crash between the two swaps, or before the folder is written, leaves
    /// the saved folder pointing at pre-compaction offsets and keys.
    pub fn compact(&mut self, progress: Option<Progress<'_>>) -> Result<()> {
        self.folder.save()?;
        let moved = self.store.compact(&self.folder.locations(), progress)?;
        self.folder.set_locations(&moved);
        self.delete_messages_cache();
        self.folder.save()?;
        info!(messages = moved.len(), "Compacted account");
        Ok(())
    }

    /// Rebuild all index records from the stored messages.
    pub fn check(&mut self, ignore_errors: bool, progress: Option<Progress<'_>>) -> Result<CheckSummary> {
        self.check_with(&mut store::default_index_source, ignore_errors, progress)
    }

    /// Rebuild all index records, asking `provider` for every summary.
    pub fn check_with(
        &mut self,
        provider: &mut dyn FnMut(&CheckInput) -> Result<IndexSource>,
        ignore_errors: bool,
        progress: Option<Progress<'_>>,
    ) -> Result<CheckSummary> {
        self.folder.save()?;
        let results = self.store.check(
            &self.folder.locations(),
            provider,
            ignore_errors,
            progress,
        )?;
        self.delete_messages_cache();

        let mut summary = CheckSummary::default();
        let ids: Vec<u64> = self.folder.messages().iter().map(|m| m.id).collect();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                CheckResult::Rebuilt {
                    index_key,
                    index_length,
                } => {
                    if let Some(handle) = self.folder.get_mut(id) {
                        handle.location.index_key = index_key;
                        handle.location.index_length = index_length;
                    }
                    summary.rebuilt += 1;
                }
                CheckResult::Ignored => {
                    if let Some(handle) = self.folder.remove(id) {
                        // The old index record went away with the old index store.
                        let body = StoredMessageLocation {
                            index_key: ABSENT,
                            index_length: 0,
                            ..handle.location
                        };
                        self.store.free(&body);
                    }
                    summary.removed.push(id);
                }
            }
        }
        self.folder.save()?;
        info!(rebuilt = summary.rebuilt, removed = summary.removed.len(), "Checked account");
        Ok(summary)
    }

    /// Add body files nobody references back into the folder.
    pub fn salvage(&mut self, progress: Option<Progress<'_>>) -> Result<Vec<u64>> {
        let recovered = self.store.salvage(&self.folder.locations(), progress)?;
        let ids = recovered
            .into_iter()
            .map(|m| self.folder.push(m.location, 0))
            .collect::<Vec<_>>();
        self.folder.save()?;
        Ok(ids)
    }

    pub fn free_unused(&self) -> Result<()> {
        self.store.free_unused()
    }

    /// Reclaim allocations no message references.
    pub fn free_unreferenced(&self) -> Result<()> {
        self.store.free_unreferenced(&self.folder.locations())
    }

    pub fn save_decoded(&self, id: u64, data: &[u8]) -> Result<()> {
        let location = self.location(id)?;
        self.store.save_decoded(&location, data)
    }

    pub fn load_decoded(&self, id: u64) -> Result<Option<Vec<u8>>> {
        let location = self.location(id)?;
        self.store.load_decoded(&location)
    }

    pub fn stats(&self) -> Result<AccountStats> {
        Ok(AccountStats {
            messages: self.folder.len(),
            index_only: self
                .folder
                .messages()
                .iter()
                .filter(|m| !m.location.has_body())
                .count(),
            store: self.store.stats()?,
        })
    }

    /// Persist the folder and flush the store.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()?;
        self.folder.save()
    }
}

impl Drop for Account {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(dir = %self.dir.display(), error = %e, "Failed to flush account");
        }
    }
}
