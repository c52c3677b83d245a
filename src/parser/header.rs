//! RFC 5322 header parsing: folding, encoded-words (RFC 2047) and the
//! summary fields stored in index records.

use tracing::warn;

use crate::model::address::{self, EmailAddress};

/// Unfolded header fields of one message, in order of appearance.
///
/// Field names are lowercased; values are raw (encoded-words are kept).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    fields: Vec<(String, String)>,
}

impl MessageHeader {
    /// Parse a raw header block. Never fails: malformed lines are skipped.
    pub fn parse(raw_headers: &[u8]) -> Self {
        let text = decode_header_bytes(raw_headers);
        Self {
            fields: unfold_headers(&text),
        }
    }

    /// Build a header from `(name, value)` pairs.
    pub fn from_fields<N, V>(fields: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(n, v)| (n.into().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// First value of a header (case-insensitive name).
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of header fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the header has no fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// List names of an address header, with encoded-words left as they are.
    pub fn raw_names(&self, name: &str) -> String {
        self.get(name).map(address::names).unwrap_or_default()
    }

    /// List names of an address header, decoded for display.
    pub fn decoded_names(&self, name: &str) -> String {
        self.get(name)
            .map(|raw| {
                EmailAddress::parse_list(raw)
                    .iter()
                    .map(|a| decode_encoded_words(a.name()))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    }

    /// Raw subject line.
    pub fn raw_subject(&self) -> String {
        self.get("subject").unwrap_or_default().to_string()
    }

    /// Decoded subject line.
    pub fn subject(&self) -> String {
        decode_encoded_words(self.get("subject").unwrap_or_default())
    }

    /// The `Message-Id` in angle brackets, or empty.
    pub fn message_id(&self) -> String {
        self.get("message-id")
            .map(extract_angle_bracket)
            .unwrap_or_default()
    }

    /// All message ids listed in `References`, space separated.
    pub fn references(&self) -> String {
        self.get("references")
            .map(|r| extract_all_angle_brackets(r).join(" "))
            .unwrap_or_default()
    }

    /// The id of the parent message: the last `References` entry, falling
    /// back to the first `In-Reply-To` id.
    pub fn reference(&self) -> String {
        if let Some(last) = self
            .get("references")
            .and_then(|r| extract_all_angle_brackets(r).pop())
        {
            return last;
        }
        self.get("in-reply-to")
            .and_then(|r| extract_all_angle_brackets(r).into_iter().next())
            .unwrap_or_default()
    }
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// Tokens that fail to decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two adjacent encoded-words is dropped (RFC 2047 §6.2)
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after_start = &remaining[start + 2..];
        match decode_one_word(after_start) {
            Some((text, consumed)) => {
                result.push_str(&text);
                remaining = &after_start[consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str("=?");
                remaining = after_start;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Decode `charset?encoding?text?=`; returns the text and the bytes consumed.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let mut parts = s.splitn(3, '?');
    let charset = parts.next()?;
    let encoding = parts.next()?;
    let rest = parts.next()?;
    let end = rest.find("?=")?;
    let encoded_text = &rest[..end];
    let consumed = charset.len() + 1 + encoding.len() + 1 + end + 2;

    let bytes = match encoding {
        "B" | "b" => decode_base64(encoded_text)?,
        "Q" | "q" => decode_q_encoding(encoded_text),
        _ => return None,
    };

    Some((decode_charset(charset, &bytes), consumed))
}

/// Base64 decoding for encoded-words; padding and whitespace are tolerated.
fn decode_base64(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some(u32::from(c - b'A')),
            b'a'..=b'z' => Some(u32::from(c - b'a') + 26),
            b'0'..=b'9' => Some(u32::from(c - b'0') + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        if c.is_ascii_whitespace() {
            continue;
        }
        acc = (acc << 6) | value(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}

/// Decode Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                    }
                    None => {
                        result.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    result
}

/// Decode bytes using a named charset.
fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    match encoding_rs::Encoding::for_label(charset.trim().as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => {
            warn!(charset = charset, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Extract content between `<` and `>`, brackets included.
fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(end) = trimmed[start..].find('>') {
            return trimmed[start..start + end + 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Extract all `<…>` tokens from a string.
fn extract_all_angle_brackets(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = s;
    while let Some(start) = remaining.find('<') {
        match remaining[start..].find('>') {
            Some(end) => {
                result.push(remaining[start..start + end + 1].to_string());
                remaining = &remaining[start + end + 1..];
            }
            None => break,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_encoded_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYSBtdW5kbw==?="), "Hola mundo");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
    }

    #[test]
    fn test_decode_adjacent_encoded_words() {
        let input = "=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_mixed_plain_and_encoded() {
        assert_eq!(
            decode_encoded_words("Re: =?UTF-8?B?SG9sYQ==?= there"),
            "Re: Hola there"
        );
    }

    #[test]
    fn test_decode_japanese_base64() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?5bGx55Sw5aSq6YOO?="), "山田太郎");
    }

    #[test]
    fn test_unknown_encoding_kept_verbatim() {
        assert_eq!(decode_encoded_words("=?UTF-8?X?abc?="), "=?UTF-8?X?abc?=");
    }

    #[test]
    fn test_unfold_headers() {
        let header = MessageHeader::parse(
            b"Subject: This is a long\r\n\tsubject line\r\nFrom: user@example.com\r\n",
        );
        assert_eq!(header.len(), 2);
        assert_eq!(header.get("Subject"), Some("This is a long subject line"));
    }

    #[test]
    fn test_names_raw_and_decoded() {
        let header = MessageHeader::parse(
            b"From: =?ISO-8859-1?Q?Ren=E9?= <rene@example.com>, bob@example.com\r\n",
        );
        assert_eq!(
            header.raw_names("from"),
            "=?ISO-8859-1?Q?Ren=E9?=, bob@example.com"
        );
        assert_eq!(header.decoded_names("from"), "René, bob@example.com");
    }

    #[test]
    fn test_reference_prefers_last_reference() {
        let header = MessageHeader::parse(
            b"References: <a@x> <b@x>\r\nIn-Reply-To: <c@x>\r\n",
        );
        assert_eq!(header.references(), "<a@x> <b@x>");
        assert_eq!(header.reference(), "<b@x>");
    }

    #[test]
    fn test_reference_falls_back_to_in_reply_to() {
        let header = MessageHeader::parse(b"In-Reply-To: <c@x>\r\n");
        assert_eq!(header.reference(), "<c@x>");
    }

    #[test]
    fn test_message_id() {
        let header = MessageHeader::parse(b"Message-ID:  <msg001@example.com> \r\n");
        assert_eq!(header.message_id(), "<msg001@example.com>");
    }

    #[test]
    fn test_windows_1252_fallback() {
        let header = MessageHeader::parse(b"Subject: M\xfcller\r\n");
        assert_eq!(header.subject(), "Müller");
    }
}
