//! Byte-level primitives shared by message framing and the discovery
//! advertisement: fixed-width integers, LEB128 varints, and a bounds-checked
//! reader that reports truncation as [`MalformedMessage`].

use crate::error::MalformedMessage;

/// Longest LEB128 encoding of a `u32`.
pub const MAX_VARINT_LEN: usize = 5;

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_u16_be(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u32_be(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u32_le(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a
/// character.
pub fn truncate_utf8(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn advance(&mut self, len: usize) {
        self.pos = (self.pos + len).min(self.buf.len());
    }

    pub fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], MalformedMessage> {
        if len > self.remaining() {
            return Err(MalformedMessage::Truncated { field });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, MalformedMessage> {
        Ok(self.read_bytes(1, field)?[0])
    }

    pub fn read_u16_be(&mut self, field: &'static str) -> Result<u16, MalformedMessage> {
        let bytes = self.read_bytes(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_be(&mut self, field: &'static str) -> Result<u32, MalformedMessage> {
        let bytes = self.read_bytes(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32_le(&mut self, field: &'static str) -> Result<u32, MalformedMessage> {
        let bytes = self.read_bytes(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_varint(&mut self, field: &'static str) -> Result<u32, MalformedMessage> {
        let mut value: u64 = 0;
        for index in 0..MAX_VARINT_LEN {
            let byte = self.read_u8(field)?;
            value |= u64::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return u32::try_from(value).map_err(|_| MalformedMessage::VarintOverflow);
            }
        }
        Err(MalformedMessage::VarintOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths_match_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, u32::MAX] {
            let mut out = Vec::new();
            put_varint(&mut out, value);
            assert_eq!(out.len(), varint_len(value), "value {}", value);

            let mut reader = WireReader::new(&out);
            assert_eq!(reader.read_varint("test").unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_varint_rejects_sixth_byte() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_varint("len"), Err(MalformedMessage::VarintOverflow));
    }

    #[test]
    fn test_varint_rejects_value_above_u32() {
        // Five bytes whose top group carries bits past 32.
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_varint("len"), Err(MalformedMessage::VarintOverflow));
    }

    #[test]
    fn test_truncated_reads_name_the_field() {
        let bytes = [1, 2];
        let mut reader = WireReader::new(&bytes);
        assert_eq!(
            reader.read_u32_le("sequence"),
            Err(MalformedMessage::Truncated { field: "sequence" })
        );
        // A failed read consumes nothing.
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        assert_eq!(truncate_utf8("short", 32), "short");
        assert_eq!(truncate_utf8("abcdef", 3), "abc");
        // "é" is two bytes; cutting at 2 would split it.
        assert_eq!(truncate_utf8("aé", 2), "a");
        assert_eq!(truncate_utf8("", 0), "");
    }

    #[test]
    fn test_fixed_width_byte_order() {
        let mut out = Vec::new();
        put_u16_be(&mut out, 0x1234);
        put_u32_be(&mut out, 0xdead_beef);
        put_u32_le(&mut out, 0xdead_beef);
        assert_eq!(&out[..2], &[0x12, 0x34]);
        assert_eq!(&out[2..6], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&out[6..], &[0xef, 0xbe, 0xad, 0xde]);

        let mut reader = WireReader::new(&out);
        assert_eq!(reader.read_u16_be("a").unwrap(), 0x1234);
        assert_eq!(reader.read_u32_be("b").unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u32_le("c").unwrap(), 0xdead_beef);
    }
}
