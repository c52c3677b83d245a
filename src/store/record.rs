//! Index record framing.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ payload_len: u32 LE  (bytes after prefix)    │
//! │ text_len:    u32 LE                          │
//! ├──────────────────────────────────────────────┤
//! │ index text: 6 raw fields, each '\n'-ended    │
//! │  From, To, Subject, Message-Id,              │
//! │  References, Label                           │
//! ├──────────────────────────────────────────────┤
//! │ cache section: 5 × (u32 LE len + UTF-8)      │
//! │  From, To, Subject, Message-Id, Reference    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The index text keeps header values as written (encoded-words intact);
//! the cache section holds the decoded display strings. Records carry their
//! own size so they can be read back from a key alone.
//!
//! Malformed records never fail: missing or truncated fields read as empty.

use byteorder::{ByteOrder, LittleEndian};

use crate::model::field::{CacheField, IndexField};
use crate::parser::header::MessageHeader;

/// Size of the fixed record prefix.
pub const PREFIX_LEN: usize = 8;

/// The six raw summary fields of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRecord {
    fields: [String; IndexField::COUNT],
}

impl IndexRecord {
    /// Summary of a parsed header, filed under `label`.
    pub fn from_header(header: &MessageHeader, label: &str) -> Self {
        let mut record = Self::default();
        record.set(IndexField::From, &header.raw_names("From"));
        record.set(IndexField::To, &header.raw_names("To"));
        record.set(IndexField::Subject, &header.raw_subject());
        record.set(IndexField::MessageId, &header.message_id());
        record.set(IndexField::References, &header.references());
        record.set(IndexField::Label, label);
        record
    }

    /// Parse the index text section.
    pub fn parse(text: &[u8]) -> Self {
        let mut record = Self::default();
        let text = String::from_utf8_lossy(text);
        for (slot, line) in record.fields.iter_mut().zip(text.split('\n')) {
            *slot = line.to_string();
        }
        record
    }

    pub fn get(&self, field: IndexField) -> &str {
        &self.fields[field.position()]
    }

    /// Replace one field. Line breaks become spaces.
    pub fn set(&mut self, field: IndexField, value: &str) {
        self.fields[field.position()] = single_line(value);
    }

    /// Serialize as the index text section.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            out.extend_from_slice(field.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Rebuild a header carrying this summary, for re-indexing a message
    /// whose body is not stored.
    pub fn to_header(&self) -> MessageHeader {
        let mut fields = vec![
            ("From", self.get(IndexField::From).to_string()),
            ("To", self.get(IndexField::To).to_string()),
            ("Subject", self.get(IndexField::Subject).to_string()),
        ];
        let id = self.get(IndexField::MessageId);
        if !id.is_empty() {
            fields.push(("Message-ID", id.to_string()));
        }
        let refs = self.get(IndexField::References);
        if !refs.is_empty() {
            fields.push(("References", refs.to_string()));
        }
        MessageHeader::from_fields(fields)
    }
}

/// The five decoded display fields of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    fields: [String; CacheField::COUNT],
}

impl CacheEntry {
    /// Decode the display fields of a header.
    pub fn from_header(header: &MessageHeader) -> Self {
        let mut entry = Self::default();
        entry.set(CacheField::From, header.decoded_names("From"));
        entry.set(CacheField::To, header.decoded_names("To"));
        entry.set(CacheField::Subject, header.subject());
        entry.set(CacheField::MessageId, header.message_id());
        entry.set(CacheField::Reference, header.reference());
        entry
    }

    /// Parse a cache section.
    pub fn parse(section: &[u8]) -> Self {
        let mut entry = Self::default();
        let mut cursor = section;
        for slot in entry.fields.iter_mut() {
            match next_string(cursor) {
                Some((value, rest)) => {
                    *slot = String::from_utf8_lossy(value).into_owned();
                    cursor = rest;
                }
                None => break,
            }
        }
        entry
    }

    pub fn get(&self, field: CacheField) -> &str {
        &self.fields[field.position()]
    }

    pub fn set(&mut self, field: CacheField, value: String) {
        self.fields[field.position()] = value;
    }

    /// Serialize as a cache section.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            push_u32(&mut out, field.len() as u32);
            out.extend_from_slice(field.as_bytes());
        }
        out
    }
}

/// Decode a single field of a cache section without decoding the others.
pub fn cache_field(section: &[u8], field: CacheField) -> String {
    let mut cursor = section;
    for position in 0..=field.position() {
        let Some((value, rest)) = next_string(cursor) else {
            return String::new();
        };
        if position == field.position() {
            return String::from_utf8_lossy(value).into_owned();
        }
        cursor = rest;
    }
    String::new()
}

fn next_string(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let len = LittleEndian::read_u32(&data[..4]) as usize;
    let rest = &data[4..];
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Frame an index text section and a cache section into one record.
pub fn compose(text: &[u8], cache: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + text.len() + cache.len());
    push_u32(&mut out, (text.len() + cache.len()) as u32);
    push_u32(&mut out, text.len() as u32);
    out.extend_from_slice(text);
    out.extend_from_slice(cache);
    out
}

/// Build the complete record for a freshly stored message.
pub fn build(header: &MessageHeader, label: &str) -> Vec<u8> {
    compose(
        &IndexRecord::from_header(header, label).encode(),
        &CacheEntry::from_header(header).encode(),
    )
}

/// Total record size announced by a record prefix.
pub fn record_len(prefix: &[u8]) -> Option<u32> {
    if prefix.len() < PREFIX_LEN {
        return None;
    }
    LittleEndian::read_u32(&prefix[..4]).checked_add(PREFIX_LEN as u32)
}

/// Split a record into its index text and cache sections.
///
/// A record too short for its prefix yields two empty sections; sections
/// cut short by the end of the data are truncated.
pub fn split(record: &[u8]) -> (&[u8], &[u8]) {
    if record.len() < PREFIX_LEN {
        return (&[], &[]);
    }
    let payload_len = LittleEndian::read_u32(&record[..4]) as usize;
    let text_len = LittleEndian::read_u32(&record[4..8]) as usize;
    let payload = &record[PREFIX_LEN..];
    let payload = &payload[..payload.len().min(payload_len)];
    let text_len = text_len.min(payload.len());
    payload.split_at(text_len)
}
