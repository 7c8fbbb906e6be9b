//! Wire codec.
//!
//! `Archive` is a growable byte buffer with a read cursor. Values are written
//! in call order with no tags:
//! - integers and floats little-endian,
//! - `bool` as one byte,
//! - strings and blobs as a `u32` length followed by the bytes.
//!
//! Reads are checked: running past the end returns `NetError::Truncated`
//! instead of producing garbage.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::NetError;

/// A value with a fixed wire encoding.
pub trait Wire: Sized {
    fn write_to(&self, ar: &mut Archive);
    fn read_from(ar: &mut Archive) -> Result<Self, NetError>;
}

/// Growable buffer with a read cursor.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    buf: BytesMut,
    cursor: usize,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Wraps existing bytes for reading, cursor at 0.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
            cursor: 0,
        }
    }

    /// Appends a typed value.
    pub fn write<T: Wire>(&mut self, value: &T) -> &mut Self {
        value.write_to(self);
        self
    }

    /// Reads a typed value at the cursor and advances.
    pub fn read<T: Wire>(&mut self) -> Result<T, NetError> {
        T::read_from(self)
    }

    /// Appends raw bytes without a length prefix (partial stream reads).
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Moves the read cursor. Positions past the end clamp to the end.
    pub fn reset_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.buf.len());
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Unread bytes after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Unread bytes as a slice.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    /// Drops everything before the cursor and rewinds it to 0.
    pub fn compact(&mut self) {
        let _ = self.buf.split_to(self.cursor);
        self.cursor = 0;
    }

    /// Freezes the whole buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Takes exactly `n` bytes at the cursor.
    pub fn take(&mut self, n: usize) -> Result<&[u8], NetError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(NetError::Truncated {
                needed: n,
                remaining,
            });
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.buf[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], NetError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn put_len(&mut self, len: usize) {
        self.buf.put_u32_le(len as u32);
    }

    fn take_len(&mut self) -> Result<usize, NetError> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }
}

macro_rules! wire_number {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl Wire for $ty {
                fn write_to(&self, ar: &mut Archive) {
                    ar.buf.$put(*self);
                }

                fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
                    Ok(<$ty>::from_le_bytes(ar.take_array()?))
                }
            }
        )*
    };
}

wire_number! {
    u16 => put_u16_le,
    u32 => put_u32_le,
    u64 => put_u64_le,
    i32 => put_i32_le,
    i64 => put_i64_le,
    f32 => put_f32_le,
    f64 => put_f64_le,
}

impl Wire for u8 {
    fn write_to(&self, ar: &mut Archive) {
        ar.buf.put_u8(*self);
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        Ok(ar.take(1)?[0])
    }
}

impl Wire for bool {
    fn write_to(&self, ar: &mut Archive) {
        ar.buf.put_u8(u8::from(*self));
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        Ok(ar.take(1)?[0] != 0)
    }
}

impl Wire for String {
    fn write_to(&self, ar: &mut Archive) {
        ar.put_len(self.len());
        ar.buf.extend_from_slice(self.as_bytes());
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        let len = ar.take_len()?;
        let raw = ar.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| NetError::InvalidUtf8)
    }
}

impl Wire for Bytes {
    fn write_to(&self, ar: &mut Archive) {
        ar.put_len(self.len());
        ar.buf.extend_from_slice(self);
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        let len = ar.take_len()?;
        Ok(Bytes::copy_from_slice(ar.take(len)?))
    }
}

impl Wire for Vec<u8> {
    fn write_to(&self, ar: &mut Archive) {
        ar.put_len(self.len());
        ar.buf.extend_from_slice(self);
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        let len = ar.take_len()?;
        Ok(ar.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_read_back_in_write_order() {
        let mut ar = Archive::new();
        ar.write(&7u8)
            .write(&-3i64)
            .write(&1.5f32)
            .write(&true)
            .write(&"hello".to_string());

        assert_eq!(ar.read::<u8>().unwrap(), 7);
        assert_eq!(ar.read::<i64>().unwrap(), -3);
        assert_eq!(ar.read::<f32>().unwrap(), 1.5);
        assert!(ar.read::<bool>().unwrap());
        assert_eq!(ar.read::<String>().unwrap(), "hello");
        assert_eq!(ar.remaining(), 0);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let mut ar = Archive::from_slice(&[1, 2]);
        let err = ar.read::<u32>().unwrap_err();
        assert_eq!(
            err,
            NetError::Truncated {
                needed: 4,
                remaining: 2
            }
        );
        // Cursor did not move on failure.
        assert_eq!(ar.position(), 0);
    }

    #[test]
    fn string_length_past_end_is_truncated() {
        let mut ar = Archive::new();
        ar.write(&100u32);
        ar.append(b"short");
        ar.reset_cursor(0);
        assert!(matches!(
            ar.read::<String>(),
            Err(NetError::Truncated { needed: 100, .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut ar = Archive::new();
        ar.write(&vec![0xffu8, 0xfe]);
        assert_eq!(ar.read::<String>(), Err(NetError::InvalidUtf8));
    }

    #[test]
    fn append_accumulates_partial_reads() {
        let mut full = Archive::new();
        full.write(&0xdead_beefu32).write(&"abc".to_string());
        let bytes = full.into_bytes();

        let mut ar = Archive::new();
        ar.append(&bytes[..3]);
        assert!(ar.read::<u32>().is_err());
        ar.append(&bytes[3..]);
        assert_eq!(ar.read::<u32>().unwrap(), 0xdead_beef);
        assert_eq!(ar.read::<String>().unwrap(), "abc");
    }

    #[test]
    fn reset_cursor_rereads_and_compact_discards() {
        let mut ar = Archive::new();
        ar.write(&1u16).write(&2u16);
        assert_eq!(ar.read::<u16>().unwrap(), 1);
        ar.reset_cursor(0);
        assert_eq!(ar.read::<u16>().unwrap(), 1);
        ar.compact();
        assert_eq!(ar.len(), 2);
        assert_eq!(ar.read::<u16>().unwrap(), 2);

        ar.reset_cursor(99);
        assert_eq!(ar.position(), ar.len());
    }
}
