//! Folder persistence: the list of message handles owned by an account.

pub mod format;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::folder::format::{FolderHeader, HEADER_SIZE, MAGIC, VERSION};
use crate::model::mail::{MessageHandle, StoredMessageLocation};
use crate::store::Layout;

/// File name of the folder inside a store directory.
pub const FOLDER_FILE: &str = "folder.idx";

/// Ordered message handles plus the id counter.
#[derive(Debug, Clone)]
pub struct Folder {
    path: PathBuf,
    layout: Layout,
    next_id: u64,
    messages: Vec<MessageHandle>,
    saved_at: Option<DateTime<Utc>>,
}

impl Folder {
    /// An empty folder to be saved at `path`.
    pub fn new(path: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            path: path.into(),
            layout,
            next_id: 1,
            messages: Vec::new(),
            saved_at: None,
        }
    }

    /// Path of the folder file in a store directory.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(FOLDER_FILE)
    }

    /// Load a folder file. Returns `None` if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let invalid = |reason: String| StoreError::InvalidFolder {
            path: path.to_path_buf(),
            reason,
        };

        if data.len() < HEADER_SIZE {
            return Err(invalid("File too small".into()));
        }
        let header: FolderHeader = bincode::deserialize(&data[..HEADER_SIZE])
            .map_err(|e| invalid(format!("Header deserialization failed: {e}")))?;
        header.validate().map_err(&invalid)?;

        let entries = &data[HEADER_SIZE..];
        let hash: [u8; 32] = Sha256::digest(entries).into();
        if hash != header.sha256_entries {
            return Err(invalid("Entry checksum mismatch".into()));
        }
        let messages: Vec<MessageHandle> = bincode::deserialize(entries)
            .map_err(|e| invalid(format!("Entry deserialization failed: {e}")))?;
        if messages.len() as u64 != header.message_count {
            return Err(invalid("Message count mismatch".into()));
        }

        debug!(path = %path.display(), count = messages.len(), "Loaded folder");
        Ok(Some(Self {
            path: path.to_path_buf(),
            layout: header.layout,
            next_id: header.next_id,
            messages,
            saved_at: DateTime::from_timestamp(header.saved_at, 0),
        }))
    }

    /// Write the folder file (temp file + rename).
    pub fn save(&mut self) -> Result<()> {
        let invalid = |reason: String| StoreError::InvalidFolder {
            path: self.path.clone(),
            reason,
        };
        let entries = bincode::serialize(&self.messages)
            .map_err(|e| invalid(format!("Entry serialization failed: {e}")))?;
        let saved_at = Utc::now();
        let header = FolderHeader {
            magic: *MAGIC,
            version: VERSION,
            layout: self.layout,
            message_count: self.messages.len() as u64,
            next_id: self.next_id,
            saved_at: saved_at.timestamp(),
            sha256_entries: Sha256::digest(&entries).into(),
        };
        let header_bytes = bincode::serialize(&header)
            .map_err(|e| invalid(format!("Header serialization failed: {e}")))?;

        // Pad header to HEADER_SIZE
        let mut padded_header = vec![0u8; HEADER_SIZE];
        let copy_len = header_bytes.len().min(HEADER_SIZE);
        padded_header[..copy_len].copy_from_slice(&header_bytes[..copy_len]);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = self.path.with_extension("idx.tmp");
        write_folder_file(&tmp, &padded_header, &entries)?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        self.saved_at = Some(saved_at);
        info!(path = %self.path.display(), count = self.messages.len(), "Folder written");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// When the folder was last written, if ever.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    pub fn messages(&self) -> &[MessageHandle] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&MessageHandle> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut MessageHandle> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Add a message and return its new id.
    pub fn push(&mut self, location: StoredMessageLocation, flags: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(MessageHandle {
            id,
            location,
            flags,
        });
        id
    }

    /// Take a message out of the folder.
    pub fn remove(&mut self, id: u64) -> Option<MessageHandle> {
        let pos = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(pos))
    }

    /// Locations of all messages, in folder order.
    pub fn locations(&self) -> Vec<StoredMessageLocation> {
        self.messages.iter().map(|m| m.location).collect()
    }

    /// Replace every location, position for position.
    pub fn set_locations(&mut self, locations: &[StoredMessageLocation]) {
        for (message, location) in self.messages.iter_mut().zip(locations) {
            message.location = *location;
        }
    }
}

fn write_folder_file(path: &Path, header: &[u8], entries: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(header).map_err(|e| StoreError::io(path, e))?;
    file.write_all(entries).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(offset: u32) -> StoredMessageLocation {
        StoredMessageLocation {
            offset,
            length: 10,
            header_length: 4,
            index_key: offset + 100,
            index_length: 40,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Folder::path_in(dir.path());
        let mut folder = Folder::new(&path, Layout::Single);
        let a = folder.push(location(1), 0);
        let b = folder.push(location(2), 3);
        folder.save().unwrap();
        assert!(folder.saved_at().is_some());

        let loaded = Folder::load(&path).unwrap().unwrap();
        assert_eq!(loaded.layout(), Layout::Single);
        assert_eq!(loaded.messages(), folder.messages());
        assert_eq!(loaded.get(b).unwrap().flags, 3);

        let mut loaded = loaded;
        let c = loaded.push(location(3), 0);
        assert!(c > b && b > a);
    }

    #[test]
    fn test_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Folder::load(dir.path().join("nope.idx")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entries_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Folder::path_in(dir.path());
        let mut folder = Folder::new(&path, Layout::Multi);
        folder.push(location(1), 0);
        folder.save().unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            Folder::load(&path),
            Err(StoreError::InvalidFolder { .. })
        ));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut folder = Folder::new("unused", Layout::Multi);
        let ids: Vec<_> = (1..=3).map(|i| folder.push(location(i), 0)).collect();
        assert!(folder.remove(ids[1]).is_some());
        assert!(folder.remove(ids[1]).is_none());
        let remaining: Vec<_> = folder.messages().iter().map(|m| m.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
    }
}
