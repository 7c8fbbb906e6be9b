//! Protocol-level error type.
//!
//! Codec, registry and transport failures are expressed as `NetError` so the
//! dispatch loops can log and drop precisely. Application-facing APIs wrap
//! these in `anyhow::Error` with context.

use thiserror::Error;

/// Errors raised by the codec, the RPC registry and the transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// A read ran past the end of the buffer.
    #[error("truncated read: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// The packet kind byte is not one of the known kinds.
    #[error("unknown packet kind {0}")]
    UnknownPacketKind(u8),

    /// Bytes were left over after a complete decode.
    #[error("{0} trailing bytes after decode")]
    TrailingBytes(usize),

    /// A frame or datagram exceeded the allowed size.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// An RPC argument list does not match the declared schema.
    #[error("argument {index} does not match schema: expected {expected}")]
    SchemaMismatch { index: usize, expected: &'static str },

    /// The registry refused a new triple.
    #[error("rpc registry is full ({0} entries)")]
    RegistryFull(usize),

    /// The entry is a declaration only and cannot execute locally.
    #[error("rpc {0} has no local callback")]
    NoCallback(String),

    /// A queue refused an item under the reject-new policy.
    #[error("queue is full ({0} items)")]
    QueueFull(usize),

    /// The connection handle is not known to the transport.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// The transport has not been opened yet.
    #[error("transport is not open")]
    NotOpen,

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}
