//! Generic tag-length-value container
//!
//! Several wire elements pack their opaque attribute blocks with this shared
//! TLV format: a tag of configurable width, an optional leading entry-count
//! field of the same width, then per-entry tag + 2-byte big-endian length +
//! value bytes.
//!
//! Reading is deliberately tolerant in two ways that mirror official client
//! behavior: end-of-stream at a tag boundary terminates the container, and a
//! duplicate tag keeps the first value and discards the new one.

use crate::errors::DecodeError;

// ----------------------------------------------------------------------------
// Tag Width
// ----------------------------------------------------------------------------

/// Width of the tag field (and of the optional leading count field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagWidth {
    One,
    Two,
    Four,
}

impl TagWidth {
    /// Width in bytes
    pub const fn size(self) -> usize {
        match self {
            TagWidth::One => 1,
            TagWidth::Two => 2,
            TagWidth::Four => 4,
        }
    }

    /// All-ones sentinel tag value terminating a container early
    pub const fn sentinel(self) -> u32 {
        match self {
            TagWidth::One => 0xFF,
            TagWidth::Two => 0xFFFF,
            TagWidth::Four => 0xFFFF_FFFF,
        }
    }

    fn read(self, data: &[u8]) -> u32 {
        match self {
            TagWidth::One => data[0] as u32,
            TagWidth::Two => u16::from_be_bytes([data[0], data[1]]) as u32,
            TagWidth::Four => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        }
    }

    fn write(self, value: u32, out: &mut Vec<u8>) {
        match self {
            TagWidth::One => out.push(value as u8),
            TagWidth::Two => out.extend_from_slice(&(value as u16).to_be_bytes()),
            TagWidth::Four => out.extend_from_slice(&value.to_be_bytes()),
        }
    }
}

// ----------------------------------------------------------------------------
// TLV Container
// ----------------------------------------------------------------------------

/// An ordered TLV container. Insertion order is preserved for re-encoding;
/// lookups return the first entry with a matching tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv {
    entries: Vec<(u32, Vec<u8>)>,
}

impl Tlv {
    /// Create a new empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. A duplicate tag is kept in the container (the wire
    /// format permits it); readers will see only the first.
    pub fn put(mut self, tag: u32, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push((tag, value.into()));
        self
    }

    /// Append a big-endian u32 entry
    pub fn put_u32(self, tag: u32, value: u32) -> Self {
        self.put(tag, value.to_be_bytes().to_vec())
    }

    /// Append a big-endian i32 entry
    pub fn put_i32(self, tag: u32, value: i32) -> Self {
        self.put(tag, value.to_be_bytes().to_vec())
    }

    /// Append a UTF-8 string entry
    pub fn put_str(self, tag: u32, value: &str) -> Self {
        self.put(tag, value.as_bytes().to_vec())
    }

    /// First value stored under `tag`
    pub fn get(&self, tag: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    /// First value under `tag`, decoded as big-endian u32
    pub fn get_u32(&self, tag: u32) -> Option<u32> {
        let value = self.get(tag)?;
        let bytes: [u8; 4] = value.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// First value under `tag`, decoded as big-endian i32
    pub fn get_i32(&self, tag: u32) -> Option<i32> {
        let value = self.get(tag)?;
        let bytes: [u8; 4] = value.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    /// First value under `tag`, decoded as UTF-8
    pub fn get_str(&self, tag: u32) -> Option<&str> {
        core::str::from_utf8(self.get(tag)?).ok()
    }

    /// Number of entries, duplicates included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode all entries, optionally prefixed by an entry-count field of the
    /// same width as the tag
    pub fn encode(&self, width: TagWidth, with_count: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if with_count {
            width.write(self.entries.len() as u32, &mut out);
        }
        for (tag, value) in &self.entries {
            width.write(*tag, &mut out);
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    /// Decode a container.
    ///
    /// End-of-stream exactly at a tag boundary terminates the container; a
    /// sentinel all-ones tag terminates it early; a duplicate tag keeps the
    /// first value. Truncation inside an entry is an error.
    pub fn decode(data: &[u8], width: TagWidth, with_count: bool) -> Result<Self, DecodeError> {
        let mut offset = 0;
        let tag_size = width.size();

        let mut remaining_count = if with_count {
            if data.len() < tag_size {
                return Err(DecodeError::truncated("tlv-count", tag_size, data));
            }
            let count = width.read(&data[..tag_size]);
            offset += tag_size;
            Some(count)
        } else {
            None
        };

        let mut tlv = Tlv::new();
        loop {
            if let Some(0) = remaining_count {
                break;
            }
            // EOF at a tag boundary terminates the container
            if offset == data.len() {
                break;
            }
            if data.len() - offset < tag_size {
                return Err(DecodeError::truncated("tlv-tag", tag_size, &data[offset..]));
            }
            let tag = width.read(&data[offset..]);
            offset += tag_size;
            if tag == width.sentinel() {
                break;
            }

            if data.len() - offset < 2 {
                return Err(DecodeError::truncated("tlv-length", 2, &data[offset..]));
            }
            let length = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 2;

            if data.len() - offset < length {
                return Err(DecodeError::truncated("tlv-value", length, &data[offset..]));
            }
            let value = data[offset..offset + length].to_vec();
            offset += length;

            // Duplicate tags keep the first value
            if tlv.get(tag).is_none() {
                tlv.entries.push((tag, value));
            }

            if let Some(count) = remaining_count.as_mut() {
                *count -= 1;
            }
        }

        Ok(tlv)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_widths() {
        let tlv = Tlv::new()
            .put_u32(1, 42)
            .put_str(2, "hello")
            .put(3, vec![0xAA, 0xBB]);

        for width in [TagWidth::One, TagWidth::Two, TagWidth::Four] {
            for with_count in [false, true] {
                let encoded = tlv.encode(width, with_count);
                let decoded = Tlv::decode(&encoded, width, with_count).unwrap();
                assert_eq!(decoded, tlv);
            }
        }
    }

    #[test]
    fn test_typed_accessors() {
        let tlv = Tlv::new().put_u32(7, 1234).put_i32(8, -5).put_str(9, "ok");
        assert_eq!(tlv.get_u32(7), Some(1234));
        assert_eq!(tlv.get_i32(8), Some(-5));
        assert_eq!(tlv.get_str(9), Some("ok"));
        assert_eq!(tlv.get(10), None);
    }

    #[test]
    fn test_duplicate_tag_keeps_first() {
        let encoded = Tlv::new()
            .put_str(1, "first")
            .put_str(1, "second")
            .encode(TagWidth::One, false);
        let decoded = Tlv::decode(&encoded, TagWidth::One, false).unwrap();
        assert_eq!(decoded.get_str(1), Some("first"));
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_sentinel_terminates_early() {
        let mut encoded = Tlv::new().put_str(1, "kept").encode(TagWidth::One, false);
        encoded.push(0xFF); // sentinel tag
        encoded.extend_from_slice(&[0x00, 0x04, 1, 2, 3, 4]); // never read

        let decoded = Tlv::decode(&encoded, TagWidth::One, false).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get_str(1), Some("kept"));
    }

    #[test]
    fn test_eof_at_tag_boundary_is_ok() {
        let encoded = Tlv::new().put_u32(1, 9).encode(TagWidth::Two, false);
        let decoded = Tlv::decode(&encoded, TagWidth::Two, false).unwrap();
        assert_eq!(decoded.get_u32(1), Some(9));
    }

    #[test]
    fn test_truncated_value_is_error() {
        let mut encoded = Tlv::new().put(1, vec![0u8; 8]).encode(TagWidth::One, false);
        encoded.truncate(encoded.len() - 3);
        assert!(Tlv::decode(&encoded, TagWidth::One, false).is_err());
    }

    #[test]
    fn test_count_field_bounds_entries() {
        // Two entries encoded, count says one: the second must not be read
        let two = Tlv::new().put_str(1, "a").put_str(2, "b");
        let body = two.encode(TagWidth::One, false);
        let mut encoded = vec![0x01];
        encoded.extend_from_slice(&body);

        let decoded = Tlv::decode(&encoded, TagWidth::One, true).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get_str(1), Some("a"));
    }
}
