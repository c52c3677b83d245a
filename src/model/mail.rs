//! Message handles and the storage locations they own.

use serde::{Deserialize, Serialize};

/// Sentinel for an offset or index key that is not allocated.
pub const ABSENT: u32 = 0xFFFF_FFFF;

/// Where a message's body and index record live.
///
/// The engine never keeps a copy of a location beyond a single call; the
/// [`MessageHandle`] in the folder is the only owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredMessageLocation {
    /// Body offset (blob key or multi-file counter), or [`ABSENT`] for
    /// index-only messages.
    pub offset: u32,
    /// Total byte length of the stored message (header + separator + body).
    pub length: u32,
    /// Byte length of the header block, including the terminator of the
    /// last header line.
    pub header_length: u32,
    /// Key of the index record in the index blob store, or [`ABSENT`].
    pub index_key: u32,
    /// Byte length of the index record.
    pub index_length: u32,
}

impl StoredMessageLocation {
    /// A location with nothing allocated.
    pub const fn absent() -> Self {
        Self {
            offset: ABSENT,
            length: 0,
            header_length: 0,
            index_key: ABSENT,
            index_length: 0,
        }
    }

    /// Whether body bytes are stored for this message.
    pub fn has_body(&self) -> bool {
        self.offset != ABSENT
    }

    /// Whether an index record is stored for this message.
    pub fn has_index(&self) -> bool {
        self.index_key != ABSENT
    }

    /// The same location with the body slot cleared.
    pub fn without_body(self) -> Self {
        Self {
            offset: ABSENT,
            length: 0,
            header_length: 0,
            ..self
        }
    }
}

impl Default for StoredMessageLocation {
    fn default() -> Self {
        Self::absent()
    }
}

/// A message as owned by a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    /// Folder-unique identifier, never reused.
    pub id: u64,
    /// Storage location of body and index record.
    pub location: StoredMessageLocation,
    /// Caller-defined flag bits (seen, flagged, ...).
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_location() {
        let loc = StoredMessageLocation::absent();
        assert!(!loc.has_body());
        assert!(!loc.has_index());
    }

    #[test]
    fn test_without_body_keeps_index() {
        let loc = StoredMessageLocation {
            offset: 3,
            length: 100,
            header_length: 40,
            index_key: 7,
            index_length: 64,
        };
        let demoted = loc.without_body();
        assert!(!demoted.has_body());
        assert_eq!(demoted.length, 0);
        assert_eq!(demoted.index_key, 7);
        assert_eq!(demoted.index_length, 64);
    }
}
