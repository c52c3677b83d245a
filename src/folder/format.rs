//! Binary folder file format.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (128 bytes, fixed)            │
//! │  magic: [u8; 8] = b"MSGSTOR\0"       │
//! │  version: u32                        │
//! │  layout: Layout                      │
//! │  message_count: u64                  │
//! │  next_id: u64                        │
//! │  saved_at: i64 (Unix seconds)        │
//! │  sha256_entries: [u8; 32]            │
//! │  (padding to 128 bytes)              │
//! ├──────────────────────────────────────┤
//! │ ENTRIES (variable)                   │
//! │  bincode-serialized                  │
//! │  Vec<MessageHandle>                  │
//! └──────────────────────────────────────┘
//! ```

use crate::store::Layout;

/// Magic bytes identifying a folder file.
pub const MAGIC: &[u8; 8] = b"MSGSTOR\0";

/// Current folder format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 128;

/// Serializable folder header.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FolderHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Body layout of the store next to the folder.
    pub layout: Layout,
    pub message_count: u64,
    /// Identifier the next stored message will get.
    pub next_id: u64,
    /// When the folder was written (Unix timestamp in seconds).
    pub saved_at: i64,
    /// SHA-256 of the serialized entries.
    pub sha256_entries: [u8; 32],
}

impl FolderHeader {
    /// Validate that the header matches the current format.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FolderHeader {
        FolderHeader {
            magic: *MAGIC,
            version: VERSION,
            layout: Layout::Single,
            message_count: 3,
            next_id: 4,
            saved_at: 1_700_000_000,
            sha256_entries: [7; 32],
        }
    }

    #[test]
    fn test_header_fits_fixed_size() {
        let bytes = bincode::serialize(&header()).unwrap();
        assert!(bytes.len() <= HEADER_SIZE);
    }

    #[test]
    fn test_validate() {
        assert!(header().validate().is_ok());
        let mut bad = header();
        bad.version = 99;
        assert!(bad.validate().unwrap_err().contains("99"));
        bad.magic = *b"MBOXTUI\0";
        assert_eq!(bad.validate().unwrap_err(), "Invalid magic bytes");
    }
}
