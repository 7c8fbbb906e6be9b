//! `netplay_client`
//!
//! Session peer:
//! - Connects to a host over any shared transport
//! - Sends validation automatically and gates all other traffic on the welcome
//! - Mirrors the host's roster and replays joins for late arrivals
//! - Measures latency with a periodic ping

pub mod peer;

pub use peer::{PeerState, SessionPeer};
