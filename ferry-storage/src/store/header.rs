// Copyright 2026 ferry Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Record header codec.
//!
//! Every record starts with a small header followed by the payload bytes:
//!
//! ```plain
//! | version (1B, = 0) | header length N (3B, big-endian) | N bytes UTF-8 JSON {"key": .., "tag": ..} | payload .. |
//! ```
//!
//! The header carries the original cache key, so that a storage name collision reads as a miss.

use std::io::{ErrorKind as IoErrorKind, Read};

use ferry_common::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

pub const HEADER_VERSION: u8 = 0;
/// The header length field is 3 bytes wide.
pub const MAX_HEADER_LEN: usize = (1 << 24) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl RecordHeader {
    pub fn new(key: &str, tag: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            tag: normalize_tag(tag).map(str::to_string),
        }
    }

    /// Returns `true` if the header belongs to `key` under the content tag `tag`.
    ///
    /// Both absent and both equal are matches, any other combination is not.
    pub fn matches(&self, key: &str, tag: Option<&str>) -> bool {
        self.key == key && normalize_tag(self.tag.as_deref()) == normalize_tag(tag)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::new(ErrorKind::External, "cannot serialize record header").with_source(e))?;
        if json.len() > MAX_HEADER_LEN {
            return Err(Error::new(ErrorKind::Config, "record header too large")
                .with_context("len", json.len())
                .with_context("limit", MAX_HEADER_LEN));
        }

        let len = json.len() as u32;
        let mut buf = Vec::with_capacity(4 + json.len());
        buf.push(HEADER_VERSION);
        buf.extend_from_slice(&len.to_be_bytes()[1..]);
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Read a header from the start of `reader`, leaving it positioned right after the header.
    ///
    /// Returns `Ok(None)` for anything that is not a well-formed header: wrong version, truncated length or body,
    /// malformed JSON. Only genuine I/O failures are returned as errors.
    pub fn decode<R: Read>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let mut prefix = [0u8; 4];
        if !read_exact_or_eof(reader, &mut prefix)? {
            tracing::debug!("[record header]: truncated header prefix");
            return Ok(None);
        }
        if prefix[0] != HEADER_VERSION {
            tracing::debug!(version = prefix[0], "[record header]: unknown header version");
            return Ok(None);
        }

        let len = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
        let mut json = vec![0u8; len];
        if !read_exact_or_eof(reader, &mut json)? {
            tracing::debug!(len, "[record header]: truncated header body");
            return Ok(None);
        }

        match serde_json::from_slice(&json) {
            Ok(header) => Ok(Some(header)),
            Err(e) => {
                tracing::debug!(?e, "[record header]: malformed header json");
                Ok(None)
            }
        }
    }
}

/// An empty content tag is the same as no content tag.
fn normalize_tag(tag: Option<&str>) -> Option<&str> {
    tag.filter(|t| !t.is_empty())
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::new("https://cdn.example/img1.png", None);
        let buf = header.encode().unwrap();

        let json = br#"{"key":"https://cdn.example/img1.png"}"#;
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[1..4], &[0, 0, json.len() as u8]);
        assert_eq!(&buf[4..], json);
    }

    #[test]
    fn test_decode_leaves_cursor_after_header() {
        let header = RecordHeader::new("k", Some("v2"));
        let mut buf = header.encode().unwrap();
        buf.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buf);
        let decoded = RecordHeader::decode(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, header);

        let mut rest = vec![];
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Wrong version.
        let mut buf = RecordHeader::new("k", None).encode().unwrap();
        buf[0] = 1;
        assert_eq!(RecordHeader::decode(&mut Cursor::new(buf)).unwrap(), None);

        // Truncated prefix.
        assert_eq!(RecordHeader::decode(&mut Cursor::new(vec![0u8, 0])).unwrap(), None);

        // Truncated body.
        let buf = RecordHeader::new("key", None).encode().unwrap();
        let truncated = buf[..buf.len() - 2].to_vec();
        assert_eq!(RecordHeader::decode(&mut Cursor::new(truncated)).unwrap(), None);

        // Not a JSON object.
        let mut buf = vec![0u8, 0, 0, 3];
        buf.extend_from_slice(b"[1]");
        assert_eq!(RecordHeader::decode(&mut Cursor::new(buf)).unwrap(), None);

        // Empty input.
        assert_eq!(RecordHeader::decode(&mut Cursor::new(vec![])).unwrap(), None);
    }

    #[test]
    fn test_tag_matching() {
        let untagged = RecordHeader::new("k", None);
        assert!(untagged.matches("k", None));
        assert!(untagged.matches("k", Some("")));
        assert!(!untagged.matches("k", Some("v2")));
        assert!(!untagged.matches("other", None));

        let tagged = RecordHeader::new("k", Some("v2"));
        assert!(tagged.matches("k", Some("v2")));
        assert!(!tagged.matches("k", Some("v1")));
        assert!(!tagged.matches("k", None));

        assert_eq!(RecordHeader::new("k", Some("")), untagged);
    }
}
