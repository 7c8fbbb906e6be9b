//! `netplay_shared`
//!
//! Networking core used by both the session host and the session peer.
//!
//! Design goals:
//! - One wire format for every transport (`archive`, `packet`).
//! - Interchangeable backends behind the `Transport` trait.
//! - Tick-driven: nothing here blocks the caller's loop.
//! - No `unsafe`.

pub mod archive;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod game;
pub mod packet;
pub mod queue;
pub mod roster;
pub mod rpc;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::NetError;
    pub use crate::event::*;
    pub use crate::game::{lock_game, GameInstance, LocalGame, SharedGame};
    pub use crate::packet::{Packet, PacketKind};
    pub use crate::roster::{ConnectionRecord, SessionInfo};
    pub use crate::rpc::{DispatchKind, ParamKind, RpcContext, RpcEntry, RpcRegistry, Value};
    pub use crate::transport::{ConnectionId, Transport, TransportEvent, TransportKind};
}
