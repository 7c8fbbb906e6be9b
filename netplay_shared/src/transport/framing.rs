//! Length-delimited framing for stream sockets.
//!
//! Each encoded packet is preceded by a 4-byte big-endian length. Partial
//! socket reads are appended to a decoder buffer and complete frames are
//! peeled off as they become available. A length above `MAX_FRAME_SIZE`
//! poisons the connection.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{archive::Archive, error::NetError};

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Prefixes `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, NetError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Archive,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the socket.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.append(chunk);
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, NetError> {
        let unread = self.buf.unread();
        if unread.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(NetError::FrameTooLarge {
                size: len,
                limit: MAX_FRAME_SIZE,
            });
        }
        if unread.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.take(HEADER_LEN)?;
        let frame = Bytes::copy_from_slice(self.buf.take(len)?);
        if self.buf.remaining() == 0 {
            self.buf = Archive::new();
        } else {
            self.buf.compact();
        }
        Ok(Some(frame))
    }

    /// Bytes buffered but not yet forming a full frame.
    pub fn buffered(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let a = Packet::text(&"x".repeat(600)).encode();
        let b = Packet::text("second").encode();
        let mut wire = encode_frame(&a).unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(&b).unwrap());

        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(7) {
            dec.append(chunk);
            while let Some(f) = dec.next_frame().unwrap() {
                frames.push(f);
            }
        }
        assert_eq!(frames, vec![a, b]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn packets_larger_than_256_bytes_stay_aligned() {
        let big = Packet::text(&"y".repeat(1000));
        let small = Packet::text("z");
        let mut dec = FrameDecoder::new();
        dec.append(&encode_frame(&big.encode()).unwrap());
        dec.append(&encode_frame(&small.encode()).unwrap());

        let first = dec.next_frame().unwrap().unwrap();
        let second = dec.next_frame().unwrap().unwrap();
        assert_eq!(Packet::decode(&first).unwrap().text_payload().len(), 1000);
        assert_eq!(Packet::decode(&second).unwrap().text_payload(), "z");
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut dec = FrameDecoder::new();
        dec.append(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(
            dec.next_frame(),
            Err(NetError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn incomplete_header_waits() {
        let mut dec = FrameDecoder::new();
        dec.append(&[0, 0]);
        assert_eq!(dec.next_frame().unwrap(), None);
        assert_eq!(dec.buffered(), 2);
    }
}
