//! `netplay_engine`
//!
//! Process-level entry point for games. A `NetContext` owns at most one
//! session host and at most one session peer; every operation that could
//! create a second one fails with an error instead. Both are created on
//! first use and kept across sessions, so registered RPCs and handlers
//! survive a destroy/create or disconnect/connect.
//!
//! - `create_session` / `destroy_session` drive the host
//! - `connect` / `disconnect` drive the peer
//! - `call_rpc`, `direct_call` and `send_string` route through the peer
//!   when it is connected, else through the host
//! - `tick` steps both

use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use netplay_client::SessionPeer;
use netplay_server::SessionHost;
use netplay_shared::{
    config::NetConfig,
    game::SharedGame,
    rpc::{RpcEntry, Value},
};
use tracing::{debug, info, warn};

pub use netplay_client::PeerState;
pub use netplay_server::ConnectionState;

/// Which registry an RPC is registered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Peer,
}

/// Owner of the process's host and peer.
pub struct NetContext {
    cfg: NetConfig,
    host: Option<SessionHost>,
    peer: Option<SessionPeer>,
}

impl NetContext {
    pub fn new(cfg: NetConfig) -> Self {
        Self {
            cfg,
            host: None,
            peer: None,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn host(&self) -> Option<&SessionHost> {
        self.host.as_ref()
    }

    pub fn host_mut(&mut self) -> Option<&mut SessionHost> {
        self.host.as_mut()
    }

    pub fn peer(&self) -> Option<&SessionPeer> {
        self.peer.as_ref()
    }

    pub fn peer_mut(&mut self) -> Option<&mut SessionPeer> {
        self.peer.as_mut()
    }

    pub fn is_hosting(&self) -> bool {
        self.host.as_ref().is_some_and(SessionHost::is_running)
    }

    /// Whether a peer exists and has not dropped back to `Disconnected`.
    pub fn is_connected(&self) -> bool {
        self.peer.as_ref().is_some_and(SessionPeer::is_connected)
    }

    /// The host, created on first use.
    pub fn host_slot(&mut self) -> &mut SessionHost {
        self.host.get_or_insert_with(|| SessionHost::new(self.cfg.clone()))
    }

    /// The peer, created on first use.
    pub fn peer_slot(&mut self) -> &mut SessionPeer {
        self.peer.get_or_insert_with(|| SessionPeer::new(self.cfg.clone()))
    }

    /// Starts hosting. Fails if this context already hosts a session.
    pub async fn create_session(
        &mut self,
        name: &str,
        game: SharedGame,
        level: &str,
        port: u16,
        max_players: usize,
    ) -> anyhow::Result<std::net::SocketAddr> {
        if self.is_hosting() {
            bail!("this context already hosts a session");
        }
        let local = self
            .host_slot()
            .create_session(name, game, level, port, max_players)
            .await
            .context("create session")?;
        if let Some(peer) = self.peer.as_mut() {
            peer.set_also_hosting(true);
        }
        Ok(local)
    }

    pub fn destroy_session(&mut self) -> anyhow::Result<()> {
        match self.host.as_mut() {
            Some(host) if host.is_running() => host.destroy_session()?,
            _ => bail!("no session is running"),
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.set_also_hosting(false);
        }
        Ok(())
    }

    /// Connects the peer. Fails while it is still connected.
    pub async fn connect(&mut self, game: SharedGame, address: &str, port: u16) -> anyhow::Result<()> {
        if self.is_connected() {
            bail!("this context is already connected to a session");
        }
        let also_hosting = self.is_hosting();
        let peer = self.peer_slot();
        peer.set_also_hosting(also_hosting);
        peer.connect(game, address, port)
            .await
            .context("connect peer")
    }

    pub fn disconnect(&mut self) -> anyhow::Result<()> {
        match self.peer.as_mut() {
            Some(peer) if peer.is_connected() => peer.disconnect(),
            _ => bail!("not connected to a session"),
        }
    }

    /// Registers an RPC on one side, creating that side if needed. The
    /// registration outlives individual sessions.
    pub fn register_rpc(
        &mut self,
        side: Side,
        address: &str,
        class_name: &str,
        entry: RpcEntry,
    ) -> anyhow::Result<Option<Arc<RpcEntry>>> {
        let registered = match side {
            Side::Host => self.host_slot().register_rpc(address, class_name, entry),
            Side::Peer => self.peer_slot().register_rpc(address, class_name, entry),
        };
        registered.with_context(|| format!("register {address}::{class_name}"))
    }

    pub fn call_rpc(
        &mut self,
        address: &str,
        class_name: &str,
        function_name: &str,
        args: &[Value],
    ) -> bool {
        if let Some(peer) = self.peer.as_mut().filter(|p| p.is_connected()) {
            return peer.call_rpc(address, class_name, function_name, args);
        }
        if let Some(host) = self.host.as_mut().filter(|h| h.is_running()) {
            return host.call_rpc(address, class_name, function_name, args);
        }
        warn!(function_name, "No session to call rpc on");
        false
    }

    /// Direct call from the peer to its host.
    pub fn direct_call(&mut self, function_name: &str, data: Bytes) -> bool {
        match self.peer.as_mut().filter(|p| p.is_connected()) {
            Some(peer) => peer.direct_call(function_name, data),
            None => {
                warn!(function_name, "Not connected, direct call dropped");
                false
            }
        }
    }

    pub fn send_string(&mut self, text: &str) -> bool {
        if let Some(peer) = self.peer.as_mut().filter(|p| p.is_connected()) {
            return peer.send_string(text);
        }
        if let Some(host) = self.host.as_mut().filter(|h| h.is_running()) {
            host.send_string(text);
            return true;
        }
        debug!("No session, string dropped");
        false
    }

    /// Steps the host, then the peer.
    pub fn tick(&mut self, dt: f32) {
        if let Some(host) = self.host.as_mut() {
            host.tick(dt);
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.tick(dt);
        }
    }
}

impl Drop for NetContext {
    fn drop(&mut self) {
        if self.is_connected() {
            if let Err(e) = self.disconnect() {
                warn!(error = %e, "Disconnect on context drop failed");
            }
        }
        if self.is_hosting() {
            info!("Closing session on context drop");
            if let Err(e) = self.destroy_session() {
                warn!(error = %e, "Destroy on context drop failed");
            }
        }
    }
}
