//! The protobuf wire alphabet and the primitive reads over a byte buffer:
//! LEB128 varints with overflow detection, the zig-zag transform, keys and
//! fixed-width little-endian values.

use crate::error::DecodeError;

/// A varint never spans more than ten bytes.
pub const MAX_VARINT_BYTES: usize = 10;

/// Wire-level framing of a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    I64 = 1,
    Len = 2,
    // Groups are dead on the wire but still occupy their bit patterns.
    SGroup = 3,
    EGroup = 4,
    I32 = 5,
}

impl WireType {
    pub fn from_bits(bits: u32) -> Result<Self, DecodeError> {
        Ok(match bits {
            0 => WireType::Varint,
            1 => WireType::I64,
            2 => WireType::Len,
            3 => WireType::SGroup,
            4 => WireType::EGroup,
            5 => WireType::I32,
            _ => return Err(DecodeError::InvalidKey),
        })
    }
}

/// The leading varint of a record: `(field_id << 3) | wire_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub wire_type: WireType,
    pub field_id: u32,
}

pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ (-((n & 1) as i64))
}

pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ (-((n & 1) as i32))
}

pub fn zigzag_encode64(n: i64) -> u64 {
    ((n << 1) as u64) ^ ((n >> 63) as u64)
}

pub fn zigzag_encode32(n: i32) -> u32 {
    ((n << 1) as u32) ^ ((n >> 31) as u32)
}

/// LEB128-encode `n`, the codec inverse of [`ReadCursor::read_varint`].
pub fn write_varint(mut n: u64, out: &mut Vec<u8>) {
    while n >= 0x80 {
        out.push(n as u8 | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// An advancing view over the input buffer.
///
/// `data` shrinks from the front as values are read; the original length is
/// kept so [`bytes_read`](Self::bytes_read) can report the offset from the
/// start of the view. Fixed-width reads go through `from_le_bytes`, which
/// byte-swaps on big-endian hosts.
#[derive(Clone, Copy)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    base_len: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ReadCursor {
            data,
            base_len: data.len(),
        }
    }

    /// Derive a child cursor over `data`, used for nested message payloads.
    pub fn with_data(&self, data: &'a [u8]) -> Self {
        ReadCursor::new(data)
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_read(&self) -> usize {
        self.base_len - self.data.len()
    }

    /// The unread tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    fn advance(&mut self, n: usize) {
        self.data = &self.data[n..];
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if n > self.data.len() {
            return Err(DecodeError::NotEnoughBytesRead);
        }
        self.advance(n);
        Ok(())
    }

    /// Read an unsigned LEB128 varint of at most ten groups.
    ///
    /// Fails with `Overflow` when the tenth byte would shift non-zero bits
    /// past the top of a u64. Never reads past the terminator byte.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let Some(&b) = self.data.get(i) else {
                return Err(DecodeError::NotEnoughBytesRead);
            };
            if i == MAX_VARINT_BYTES - 1 && b > 1 {
                return Err(DecodeError::Overflow);
            }
            result |= ((b & 0x7F) as u64) << (7 * i);
            if b < 0x80 {
                self.advance(i + 1);
                return Ok(result);
            }
        }
        Err(DecodeError::Overflow)
    }

    /// Varint limited to u32, used for keys.
    pub fn read_varint32(&mut self) -> Result<u32, DecodeError> {
        let v = self.read_varint()?;
        u32::try_from(v).map_err(|_| DecodeError::Overflow)
    }

    /// Length varint limited to `i32::MAX`.
    pub fn read_size(&mut self) -> Result<usize, DecodeError> {
        let v = self.read_varint()?;
        if v > i32::MAX as u64 {
            return Err(DecodeError::Overflow);
        }
        Ok(v as usize)
    }

    /// Decode a record key, validating the wire-type bits.
    pub fn read_key(&mut self) -> Result<Key, DecodeError> {
        let raw = self.read_varint32()?;
        Ok(Key {
            wire_type: WireType::from_bits(raw & 7)?,
            field_id: raw >> 3,
        })
    }

    pub fn read_fixed32(&mut self) -> Result<u32, DecodeError> {
        let bytes: [u8; 4] = self
            .data
            .get(..4)
            .ok_or(DecodeError::NotEnoughBytesRead)?
            .try_into()
            .unwrap();
        self.advance(4);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_fixed64(&mut self) -> Result<u64, DecodeError> {
        let bytes: [u8; 8] = self
            .data
            .get(..8)
            .ok_or(DecodeError::NotEnoughBytesRead)?
            .try_into()
            .unwrap();
        self.advance(8);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Single byte, non-zero is true.
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let &b = self.data.first().ok_or(DecodeError::NotEnoughBytesRead)?;
        self.advance(1);
        Ok(b != 0)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let slice = self
            .data
            .get(..len)
            .ok_or(DecodeError::NotEnoughBytesRead)?;
        self.advance(len);
        Ok(slice)
    }

    /// Decode a length prefix and validate that the payload fits in the
    /// remaining buffer. Returns `(prefix_len, payload_len)` with the cursor
    /// positioned at the payload start; the caller advances past the payload.
    pub fn read_length_prefix(&mut self) -> Result<(usize, usize), DecodeError> {
        let before = self.data.len();
        let len = self.read_size()?;
        let prefix_len = before - self.data.len();
        if len > self.data.len() {
            return Err(DecodeError::InvalidData);
        }
        Ok((prefix_len, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_single_byte() {
        let mut c = ReadCursor::new(&[0x05, 0xFF]);
        assert_eq!(c.read_varint().unwrap(), 5);
        assert_eq!(c.bytes_read(), 1);
        assert_eq!(c.remaining(), 1);
    }

    #[test]
    fn varint_multi_byte() {
        let mut c = ReadCursor::new(&[0x96, 0x01]);
        assert_eq!(c.read_varint().unwrap(), 150);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn varint_max() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut c = ReadCursor::new(&buf);
        assert_eq!(c.read_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn varint_overflow() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02];
        let mut c = ReadCursor::new(&buf);
        assert_eq!(c.read_varint(), Err(DecodeError::Overflow));
    }

    #[test]
    fn varint_truncated() {
        let mut c = ReadCursor::new(&[0x80, 0x80]);
        assert_eq!(c.read_varint(), Err(DecodeError::NotEnoughBytesRead));
    }

    #[test]
    fn key_decode() {
        let mut c = ReadCursor::new(&[0x08]);
        let key = c.read_key().unwrap();
        assert_eq!(key.field_id, 1);
        assert_eq!(key.wire_type, WireType::Varint);
    }

    #[test]
    fn key_invalid_wire_type() {
        // wire-type bits 6 and 7 are outside the alphabet
        let mut c = ReadCursor::new(&[0x0E]);
        assert_eq!(c.read_key(), Err(DecodeError::InvalidKey));
        let mut c = ReadCursor::new(&[0x0F]);
        assert_eq!(c.read_key(), Err(DecodeError::InvalidKey));
    }

    #[test]
    fn zigzag_decode_values() {
        assert_eq!(zigzag_decode32(0), 0);
        assert_eq!(zigzag_decode32(1), -1);
        assert_eq!(zigzag_decode32(2), 1);
        assert_eq!(zigzag_decode32(3), -2);
        assert_eq!(zigzag_decode64(4294967294), 2147483647);
        assert_eq!(zigzag_decode64(4294967295), -2147483648);
    }

    #[test]
    fn fixed_reads_little_endian() {
        let mut c = ReadCursor::new(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(c.read_fixed32().unwrap(), 0x12345678);
        let mut c = ReadCursor::new(&[1, 2, 3]);
        assert_eq!(c.read_fixed32(), Err(DecodeError::NotEnoughBytesRead));
    }

    #[test]
    fn child_cursor_over_nested_payload() {
        let mut c = ReadCursor::new(&[0x02, 0x96, 0x01, 0x07]);
        let (_, len) = c.read_length_prefix().unwrap();
        let payload = c.read_slice(len).unwrap();
        let mut child = c.with_data(payload);
        assert_eq!(child.read_varint().unwrap(), 150);
        assert_eq!(child.remaining(), 0);
        assert_eq!(c.read_varint().unwrap(), 7);
    }

    #[test]
    fn length_prefix_validates_payload() {
        let mut c = ReadCursor::new(&[0x03, b'a', b'b', b'c']);
        assert_eq!(c.read_length_prefix().unwrap(), (1, 3));
        assert_eq!(c.read_slice(3).unwrap(), b"abc");

        let mut c = ReadCursor::new(&[0x05, b'a']);
        assert_eq!(c.read_length_prefix(), Err(DecodeError::InvalidData));
    }

    proptest! {
        #[test]
        fn varint_roundtrip(v: u64) {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            let mut c = ReadCursor::new(&buf);
            prop_assert_eq!(c.read_varint().unwrap(), v);
            prop_assert_eq!(c.remaining(), 0);
        }

        #[test]
        fn zigzag32_roundtrip(v: i32) {
            prop_assert_eq!(zigzag_decode32(zigzag_encode32(v)), v);
        }

        #[test]
        fn zigzag64_roundtrip(v: i64) {
            prop_assert_eq!(zigzag_decode64(zigzag_encode64(v)), v);
        }
    }
}
