//! Engine control messages.
//!
//! Lifecycle traffic between host and peer rides in `DirectCall` packets
//! whose function name is one of the reserved names below. Payloads are
//! serde types encoded as JSON into `Packet::data`.

use anyhow::Context;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    packet::Packet,
    roster::{ConnectionRecord, SessionInfo},
};

/// Host -> new peer after successful validation.
pub const WELCOME: &str = "__welcome";
/// Host -> peers: full roster snapshot.
pub const SESSION_INFO: &str = "__session_info";
/// Host -> peers: a player joined.
pub const PLAYER_JOINED: &str = "__player_joined";
/// Host -> peers: a player left.
pub const PLAYER_LEFT: &str = "__player_left";
/// Host -> peers: session is shutting down or you were kicked.
pub const SHUTDOWN: &str = "__shutdown";
/// Peer -> host latency probe; host echoes it back as `PONG`.
pub const PING: &str = "__ping";
pub const PONG: &str = "__pong";
/// Peer -> host name change.
pub const SET_NAME: &str = "__set_name";

/// Whether a direct-call name is reserved for the engine.
pub fn is_reserved(function_name: &str) -> bool {
    function_name.starts_with("__")
}

/// Credential and identity a peer presents in its `Validation` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub credential: Vec<u8>,
    pub player_name: String,
}

/// Acknowledgment of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub you: ConnectionRecord,
    pub session: SessionInfo,
}

/// A single join or leave, stamped with the roster revision it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEvent {
    pub player: ConnectionRecord,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    pub reason: String,
}

/// Latency probe; echoed verbatim by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender's clock when the probe left, milliseconds.
    pub sent_at: u64,
    /// Sender's most recent measured round trip.
    pub last_rtt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetName {
    pub name: String,
}

/// Encodes a control payload into a `DirectCall` packet.
pub fn to_packet<T: Serialize>(function_name: &str, payload: &T) -> anyhow::Result<Packet> {
    let data = serde_json::to_vec(payload).context("serialize control payload")?;
    Ok(Packet::direct(function_name, Bytes::from(data)))
}

/// Decodes a control payload.
pub fn from_packet<T: DeserializeOwned>(packet: &Packet) -> anyhow::Result<T> {
    serde_json::from_slice(&packet.data)
        .with_context(|| format!("deserialize {} payload", packet.function_name))
}
