//! A raw RFC 5322 message split into its header block and body.

use std::path::Path;

use crate::error::{Result, StoreError};
use crate::parser::header::MessageHeader;

/// Raw message bytes plus the position where the header block ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    raw: Vec<u8>,
    header_length: usize,
}

impl Message {
    /// Wrap raw bytes, locating the end of the header block.
    ///
    /// A message without a blank line is treated as all header.
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        let header_length = header_length(&raw);
        Self { raw, header_length }
    }

    /// Read a bare `.eml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
        Ok(Self::new(data))
    }

    /// The complete message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Consume the message, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Total size in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the message has no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Length of the header block, including the last header line terminator.
    pub fn header_length(&self) -> usize {
        self.header_length
    }

    /// The header block.
    pub fn header_bytes(&self) -> &[u8] {
        &self.raw[..self.header_length]
    }

    /// Everything after the header block and the blank separator line.
    pub fn body(&self) -> &[u8] {
        let rest = &self.raw[self.header_length..];
        rest.strip_prefix(b"\r\n")
            .or_else(|| rest.strip_prefix(b"\n"))
            .unwrap_or(rest)
    }

    /// Parsed header fields.
    pub fn header(&self) -> MessageHeader {
        MessageHeader::parse(self.header_bytes())
    }

    /// The first text body part, decoded, for display.
    pub fn body_text(&self) -> Option<String> {
        let parsed = mail_parser::MessageParser::default().parse(&self.raw)?;
        parsed.body_text(0).map(|text| text.into_owned())
    }
}

/// Position just past the terminator of the last header line.
fn header_length(data: &[u8]) -> usize {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return i + 1;
        }
        if data[i..].starts_with(b"\r\n\r\n") {
            return i + 2;
        }
    }
    data.len()
}
