//! Packet envelope.
//!
//! Every message on every transport is one `Packet`, written in the fixed
//! field order: timestamp, kind, address, class name, function name, data.
//! Stream transports add their own length prefix around the encoded packet.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    archive::{Archive, Wire},
    error::NetError,
};

/// What the receiving dispatcher should do with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    /// Registered RPC identified by the address/class/function triple.
    Rpc = 0,
    /// Engine-level call named by `function_name`.
    DirectCall = 1,
    /// Free-form text in `data`.
    String = 2,
    /// Validation handshake; must be the first packet from a peer.
    Validation = 3,
}

impl PacketKind {
    pub const ALL: [PacketKind; 4] = [
        PacketKind::Rpc,
        PacketKind::DirectCall,
        PacketKind::String,
        PacketKind::Validation,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PacketKind::Rpc),
            1 => Some(PacketKind::DirectCall),
            2 => Some(PacketKind::String),
            3 => Some(PacketKind::Validation),
            _ => None,
        }
    }
}

/// Wall-clock milliseconds since the UNIX epoch, used for packet timestamps.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// The envelope carried by every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp: u64,
    pub kind: PacketKind,
    pub address: String,
    pub class_name: String,
    pub function_name: String,
    pub data: Bytes,
}

impl Packet {
    /// Builds a packet stamped with the current time.
    pub fn new(
        kind: PacketKind,
        address: impl Into<String>,
        class_name: impl Into<String>,
        function_name: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            timestamp: now_millis(),
            kind,
            address: address.into(),
            class_name: class_name.into(),
            function_name: function_name.into(),
            data,
        }
    }

    pub fn rpc(
        address: impl Into<String>,
        class_name: impl Into<String>,
        function_name: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self::new(PacketKind::Rpc, address, class_name, function_name, data)
    }

    pub fn direct(function_name: impl Into<String>, data: Bytes) -> Self {
        Self::new(PacketKind::DirectCall, "", "", function_name, data)
    }

    pub fn text(text: &str) -> Self {
        Self::new(
            PacketKind::String,
            "",
            "",
            "",
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    pub fn validation(data: Bytes) -> Self {
        Self::new(PacketKind::Validation, "", "", "", data)
    }

    /// Serializes in the fixed field order.
    pub fn encode(&self) -> Bytes {
        let mut ar = Archive::with_capacity(
            32 + self.address.len()
                + self.class_name.len()
                + self.function_name.len()
                + self.data.len(),
        );
        self.write_to(&mut ar);
        ar.into_bytes()
    }

    /// Decodes exactly one packet; trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        let mut ar = Archive::from_slice(bytes);
        let packet = Packet::read_from(&mut ar)?;
        match ar.remaining() {
            0 => Ok(packet),
            n => Err(NetError::TrailingBytes(n)),
        }
    }

    /// Text payload of a `String` packet, lossily decoded.
    pub fn text_payload(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl Wire for Packet {
    fn write_to(&self, ar: &mut Archive) {
        ar.write(&self.timestamp)
            .write(&(self.kind as u8))
            .write(&self.address)
            .write(&self.class_name)
            .write(&self.function_name)
            .write(&self.data);
    }

    fn read_from(ar: &mut Archive) -> Result<Self, NetError> {
        let timestamp = ar.read::<u64>()?;
        let raw_kind = ar.read::<u8>()?;
        let kind = PacketKind::from_u8(raw_kind).ok_or(NetError::UnknownPacketKind(raw_kind))?;
        Ok(Packet {
            timestamp,
            kind,
            address: ar.read()?,
            class_name: ar.read()?,
            function_name: ar.read()?,
            data: ar.read()?,
        })
    }
}
