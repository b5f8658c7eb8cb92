//! # Field Wire Format
//!
//! Tag-delimited, self-describing field encoding shared by every Takion
//! message. A message body is a flat sequence of fields; each field starts
//! with a key varint followed by a value whose shape is fixed by the key's
//! wire type:
//!
//! ```text
//!  key = (field_number << 3) | wire_type
//!
//!  wire_type 0  VARINT   LEB128, 1-10 bytes
//!  wire_type 1  FIXED64  8 bytes, little endian
//!  wire_type 2  LENGTH   VARINT length + raw bytes (strings, bytes, nested)
//!  wire_type 5  FIXED32  4 bytes, little endian
//! ```
//!
//! Unknown fields are skipped by the readers, so newer peers can add fields
//! without breaking older decoders.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Low-level failure while walking a field stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer ended inside a field")]
    Truncated,
    #[error("varint longer than 10 bytes")]
    VarIntOverflow,
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
    #[error("field number 0 is reserved")]
    ZeroFieldNumber,
    #[error("field {field} has wire type {actual:?}, expected {expected:?}")]
    WrongWireType {
        field: u32,
        expected: WireType,
        actual: WireType,
    },
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u32),
}

// ─── VarInt (LEB128) ────────────────────────────────────────────────────────

/// A 64-bit unsigned integer in base-128 little-endian groups.
///
/// Each byte carries 7 value bits; the high bit is set on every byte except
/// the last:
/// - `0x00..=0x7F` → 1 byte
/// - `0x80..=0x3FFF` → 2 bytes
/// - … up to 10 bytes for `u64::MAX`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Longest encoding of a 64-bit value.
    pub const MAX_LEN: usize = 10;

    #[inline]
    pub fn new(val: u64) -> Self {
        VarInt(val)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to.
    #[inline]
    pub fn encoded_len(self) -> usize {
        let bits = 64 - (self.0 | 1).leading_zeros() as usize;
        bits.div_ceil(7)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut v = self.0;
        while v >= 0x80 {
            buf.put_u8((v as u8 & 0x7F) | 0x80);
            v >>= 7;
        }
        buf.put_u8(v as u8);
    }

    /// Decode from a buffer. Fails on a truncated value or one that runs
    /// past ten bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let mut value: u64 = 0;
        for i in 0..Self::MAX_LEN {
            if !buf.has_remaining() {
                return Err(WireError::Truncated);
            }
            let byte = buf.get_u8();
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(VarInt(value));
            }
        }
        Err(WireError::VarIntOverflow)
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> Self {
        VarInt(v as u64)
    }
}

impl From<u64> for VarInt {
    fn from(v: u64) -> Self {
        VarInt(v)
    }
}

// ─── Wire Type ──────────────────────────────────────────────────────────────

/// Shape of the value that follows a field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    VarInt = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    pub fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0 => Ok(WireType::VarInt),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(WireError::UnsupportedWireType(other)),
        }
    }
}

// ─── Field Key ──────────────────────────────────────────────────────────────

/// Field number plus wire type, encoded as one varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKey {
    pub number: u32,
    pub wire_type: WireType,
}

impl FieldKey {
    pub fn new(number: u32, wire_type: WireType) -> Self {
        FieldKey { number, wire_type }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        VarInt(((self.number as u64) << 3) | self.wire_type as u64).encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let raw = VarInt::decode(buf)?.value();
        let wire_type = WireType::from_bits((raw & 0x07) as u8)?;
        let number = (raw >> 3) as u32;
        if number == 0 {
            return Err(WireError::ZeroFieldNumber);
        }
        Ok(FieldKey { number, wire_type })
    }
}

// ─── Field Values ───────────────────────────────────────────────────────────

/// One decoded field value, still untyped.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    VarInt(u64),
    Fixed64(u64),
    Bytes(Bytes),
    Fixed32(u32),
}

impl FieldValue {
    fn wire_type(&self) -> WireType {
        match self {
            FieldValue::VarInt(_) => WireType::VarInt,
            FieldValue::Fixed64(_) => WireType::Fixed64,
            FieldValue::Bytes(_) => WireType::LengthDelimited,
            FieldValue::Fixed32(_) => WireType::Fixed32,
        }
    }

    fn mismatch(&self, field: u32, expected: WireType) -> WireError {
        WireError::WrongWireType {
            field,
            expected,
            actual: self.wire_type(),
        }
    }

    pub fn as_u64(&self, field: u32) -> Result<u64, WireError> {
        match self {
            FieldValue::VarInt(v) => Ok(*v),
            other => Err(other.mismatch(field, WireType::VarInt)),
        }
    }

    /// uint32 fields keep the low 32 bits, matching how the peer parses
    /// oversized varints.
    pub fn as_u32(&self, field: u32) -> Result<u32, WireError> {
        self.as_u64(field).map(|v| v as u32)
    }

    pub fn as_bool(&self, field: u32) -> Result<bool, WireError> {
        self.as_u64(field).map(|v| v != 0)
    }

    pub fn as_f32(&self, field: u32) -> Result<f32, WireError> {
        match self {
            FieldValue::Fixed32(v) => Ok(f32::from_bits(*v)),
            other => Err(other.mismatch(field, WireType::Fixed32)),
        }
    }

    pub fn as_f64(&self, field: u32) -> Result<f64, WireError> {
        match self {
            FieldValue::Fixed64(v) => Ok(f64::from_bits(*v)),
            other => Err(other.mismatch(field, WireType::Fixed64)),
        }
    }

    pub fn into_bytes(self, field: u32) -> Result<Bytes, WireError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            other => Err(other.mismatch(field, WireType::LengthDelimited)),
        }
    }

    pub fn into_string(self, field: u32) -> Result<String, WireError> {
        let bytes = self.into_bytes(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
    }

    /// Append one or more uint32 values of a repeated field. Accepts both the
    /// packed (one LENGTH field) and unpacked (one VARINT per element) forms.
    pub fn extend_u32(self, field: u32, out: &mut Vec<u32>) -> Result<(), WireError> {
        match self {
            FieldValue::VarInt(v) => {
                out.push(v as u32);
                Ok(())
            }
            FieldValue::Bytes(mut packed) => {
                while packed.has_remaining() {
                    out.push(VarInt::decode(&mut packed)?.value() as u32);
                }
                Ok(())
            }
            other => Err(other.mismatch(field, WireType::VarInt)),
        }
    }
}

// ─── Field Reader ───────────────────────────────────────────────────────────

/// Walks the fields of one message body in wire order.
///
/// Yields `(field_number, value)` pairs; length-delimited values are
/// zero-copy slices of the input.
pub struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub fn new(buf: Bytes) -> Self {
        FieldReader { buf }
    }

    /// Next field, `Ok(None)` at a clean end of input.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue)>, WireError> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        let key = FieldKey::decode(&mut self.buf)?;
        let value = match key.wire_type {
            WireType::VarInt => FieldValue::VarInt(VarInt::decode(&mut self.buf)?.value()),
            WireType::Fixed64 => {
                if self.buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                FieldValue::Fixed64(self.buf.get_u64_le())
            }
            WireType::Fixed32 => {
                if self.buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                FieldValue::Fixed32(self.buf.get_u32_le())
            }
            WireType::LengthDelimited => {
                let len = VarInt::decode(&mut self.buf)?.value();
                if len > self.buf.remaining() as u64 {
                    return Err(WireError::Truncated);
                }
                FieldValue::Bytes(self.buf.split_to(len as usize))
            }
        };
        Ok(Some((key.number, value)))
    }
}

// ─── Field Writers ──────────────────────────────────────────────────────────

pub fn put_u64(buf: &mut BytesMut, field: u32, value: u64) {
    FieldKey::new(field, WireType::VarInt).encode(buf);
    VarInt(value).encode(buf);
}

pub fn put_u32(buf: &mut BytesMut, field: u32, value: u32) {
    put_u64(buf, field, value as u64);
}

pub fn put_bool(buf: &mut BytesMut, field: u32, value: bool) {
    put_u64(buf, field, value as u64);
}

pub fn put_f32(buf: &mut BytesMut, field: u32, value: f32) {
    FieldKey::new(field, WireType::Fixed32).encode(buf);
    buf.put_u32_le(value.to_bits());
}

pub fn put_f64(buf: &mut BytesMut, field: u32, value: f64) {
    FieldKey::new(field, WireType::Fixed64).encode(buf);
    buf.put_u64_le(value.to_bits());
}

pub fn put_bytes(buf: &mut BytesMut, field: u32, value: &[u8]) {
    FieldKey::new(field, WireType::LengthDelimited).encode(buf);
    VarInt(value.len() as u64).encode(buf);
    buf.put_slice(value);
}

pub fn put_str(buf: &mut BytesMut, field: u32, value: &str) {
    put_bytes(buf, field, value.as_bytes());
}

/// Write a nested message: the body is built by `body` and length-prefixed.
pub fn put_message(buf: &mut BytesMut, field: u32, body: impl FnOnce(&mut BytesMut)) {
    let mut nested = BytesMut::new();
    body(&mut nested);
    put_bytes(buf, field, &nested);
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── VarInt ─────────────────────────────────────────────────────────

    #[test]
    fn varint_single_byte() {
        let mut buf = BytesMut::new();
        VarInt::new(0x7F).encode(&mut buf);
        assert_eq!(&buf[..], &[0x7F]);
        assert_eq!(VarInt::new(0x7F).encoded_len(), 1);
    }

    #[test]
    fn varint_two_bytes() {
        // 300 = 0b1_0010_1100 → 0xAC 0x02
        let mut buf = BytesMut::new();
        VarInt::new(300).encode(&mut buf);
        assert_eq!(&buf[..], &[0xAC, 0x02]);
        let decoded = VarInt::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.value(), 300);
    }

    #[test]
    fn varint_max_is_ten_bytes() {
        let mut buf = BytesMut::new();
        VarInt::new(u64::MAX).encode(&mut buf);
        assert_eq!(buf.len(), VarInt::MAX_LEN);
        assert_eq!(VarInt::new(u64::MAX).encoded_len(), VarInt::MAX_LEN);
        assert_eq!(VarInt::decode(&mut buf.freeze()).unwrap().value(), u64::MAX);
    }

    #[test]
    fn varint_truncated() {
        let mut buf: &[u8] = &[0x80, 0x80];
        assert_eq!(VarInt::decode(&mut buf), Err(WireError::Truncated));
    }

    #[test]
    fn varint_overflow() {
        let mut buf: &[u8] = &[0xFF; 11];
        assert_eq!(VarInt::decode(&mut buf), Err(WireError::VarIntOverflow));
    }

    // ─── Keys and readers ───────────────────────────────────────────────

    #[test]
    fn field_key_roundtrip() {
        let mut buf = BytesMut::new();
        FieldKey::new(17, WireType::LengthDelimited).encode(&mut buf);
        let key = FieldKey::decode(&mut buf.freeze()).unwrap();
        assert_eq!(key.number, 17);
        assert_eq!(key.wire_type, WireType::LengthDelimited);
    }

    #[test]
    fn field_key_rejects_group_wire_types() {
        let mut buf: &[u8] = &[(1 << 3) | 3];
        assert_eq!(
            FieldKey::decode(&mut buf),
            Err(WireError::UnsupportedWireType(3))
        );
    }

    #[test]
    fn reader_walks_mixed_fields() {
        let mut buf = BytesMut::new();
        put_u32(&mut buf, 1, 9);
        put_str(&mut buf, 2, "abc");
        put_f32(&mut buf, 3, 0.5);
        put_f64(&mut buf, 4, -2.25);
        put_bool(&mut buf, 5, true);

        let mut reader = FieldReader::new(buf.freeze());
        let (n, v) = reader.next_field().unwrap().unwrap();
        assert_eq!((n, v.as_u32(n).unwrap()), (1, 9));
        let (n, v) = reader.next_field().unwrap().unwrap();
        assert_eq!(v.into_string(n).unwrap(), "abc");
        let (n, v) = reader.next_field().unwrap().unwrap();
        assert_eq!(v.as_f32(n).unwrap(), 0.5);
        let (n, v) = reader.next_field().unwrap().unwrap();
        assert_eq!(v.as_f64(n).unwrap(), -2.25);
        let (n, v) = reader.next_field().unwrap().unwrap();
        assert!(v.as_bool(n).unwrap());
        assert!(reader.next_field().unwrap().is_none());
    }

    #[test]
    fn reader_rejects_overlong_length() {
        let mut buf = BytesMut::new();
        FieldKey::new(2, WireType::LengthDelimited).encode(&mut buf);
        VarInt::new(50).encode(&mut buf);
        buf.put_slice(b"short");
        let mut reader = FieldReader::new(buf.freeze());
        assert_eq!(reader.next_field(), Err(WireError::Truncated));
    }

    #[test]
    fn wrong_wire_type_is_reported() {
        let value = FieldValue::Bytes(Bytes::from_static(b"x"));
        assert!(matches!(
            value.as_u32(7),
            Err(WireError::WrongWireType { field: 7, .. })
        ));
    }

    #[test]
    fn repeated_u32_packed_and_unpacked() {
        let mut packed = BytesMut::new();
        VarInt::new(1).encode(&mut packed);
        VarInt::new(300).encode(&mut packed);

        let mut out = Vec::new();
        FieldValue::Bytes(packed.freeze())
            .extend_u32(1, &mut out)
            .unwrap();
        FieldValue::VarInt(7).extend_u32(1, &mut out).unwrap();
        assert_eq!(out, vec![1, 300, 7]);
    }

    #[test]
    fn nested_message_is_length_prefixed() {
        let mut buf = BytesMut::new();
        put_message(&mut buf, 3, |inner| put_u32(inner, 1, 5));
        // key(3, LEN) = 0x1A, len = 2, key(1, VARINT) = 0x08, 5
        assert_eq!(&buf[..], &[0x1A, 0x02, 0x08, 0x05]);
    }
}
