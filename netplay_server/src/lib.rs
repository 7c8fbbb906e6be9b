//! `netplay_server`
//!
//! Session host:
//! - Listens on one of the shared transports
//! - Gates new connections behind a validation handshake
//! - Keeps the roster and pushes it to every peer on change
//! - Dispatches RPCs and relays `ServerAndClient` calls to the other peers

pub mod host;

pub use host::{ConnectionState, SessionHost};
