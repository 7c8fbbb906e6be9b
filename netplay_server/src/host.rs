//! Session host.
//!
//! Owns the listening transport, the player roster and the host-side RPC
//! registry. Everything happens inside `tick`, in this order:
//! - drain packets the transport framed since the last tick,
//! - pump connection state changes (new pending connections, drops),
//! - dispatch the drained packets,
//! - kick connections that never validated,
//! - flush the outbox.
//!
//! Remote connections start in `PendingValidation`. The only packet accepted
//! from them is a `Validation` packet whose credential satisfies the
//! validator; anything else is an immediate kick. A validated connection
//! becomes a player with the lowest free index.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use bytes::Bytes;
use netplay_shared::{
    config::NetConfig,
    control::{self, PlayerEvent, Ping, SetName, Shutdown, ValidationRequest, Welcome},
    error::NetError,
    event::{CloseReason, EventBus, HostEvent},
    game::{lock_game, SharedGame},
    packet::{Packet, PacketKind},
    queue::BoundedQueue,
    roster::{ConnectionRecord, SessionInfo},
    rpc::{encode_args, DispatchKind, RpcContext, RpcEntry, RpcKey, RpcRegistry, Value},
    transport::{self, Admission, ConnectionId, Incoming, Transport, TransportEvent},
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Predicate over the credential carried by a `Validation` packet.
pub type Validator = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
/// Host-side handler for a non-reserved direct call, given the sender's player index.
pub type DirectHandler = Box<dyn Fn(u32, &Packet) + Send + Sync>;
/// Free-form text handler, given the sender's player index.
pub type StringHandler = Box<dyn FnMut(u32, &str) + Send>;

/// Server-side state of one remote connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    PendingValidation,
    Validated,
}

struct PendingConn {
    remote: SocketAddr,
    since: Instant,
}

struct Outgoing {
    target: ConnectionId,
    bytes: Bytes,
    reliable: bool,
}

/// Session host.
pub struct SessionHost {
    cfg: NetConfig,
    transport: Box<dyn Transport>,
    admission: Option<Arc<Admission>>,
    banned: HashSet<IpAddr>,
    registry: RpcRegistry,
    game: Option<SharedGame>,
    session: SessionInfo,
    pending: HashMap<ConnectionId, PendingConn>,
    remotes: HashMap<ConnectionId, SocketAddr>,
    outbox: BoundedQueue<Outgoing>,
    events: EventBus,
    validator: Validator,
    direct_handlers: HashMap<String, DirectHandler>,
    string_handler: Option<StringHandler>,
    running: bool,
    local_addr: Option<SocketAddr>,
    ticks: u64,
    uptime: f32,
}

fn token_validator(token: &str) -> Validator {
    let token = token.as_bytes().to_vec();
    Box::new(move |credential| credential == token.as_slice())
}

impl SessionHost {
    /// Creates a host using the backend selected in `cfg`.
    pub fn new(cfg: NetConfig) -> Self {
        let transport = transport::create(&cfg);
        Self::with_transport(cfg, transport)
    }

    /// Creates a host over a caller-supplied backend.
    pub fn with_transport(cfg: NetConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            registry: RpcRegistry::new(cfg.registry_capacity),
            outbox: BoundedQueue::new(cfg.outbox_capacity, cfg.overflow),
            validator: token_validator(&cfg.validation_token),
            cfg,
            transport,
            admission: None,
            banned: HashSet::new(),
            game: None,
            session: SessionInfo::default(),
            pending: HashMap::new(),
            remotes: HashMap::new(),
            events: EventBus::default(),
            direct_handlers: HashMap::new(),
            string_handler: None,
            running: false,
            local_addr: None,
            ticks: 0,
            uptime: 0.0,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Current roster snapshot.
    pub fn session_info(&self) -> &SessionInfo {
        &self.session
    }

    pub fn connection_state(&self, conn: ConnectionId) -> Option<ConnectionState> {
        if self.pending.contains_key(&conn) {
            Some(ConnectionState::PendingValidation)
        } else if self.session.by_handle(conn).is_some() {
            Some(ConnectionState::Validated)
        } else {
            None
        }
    }

    /// Number of connections still waiting to validate.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        self.events.drain::<HostEvent>()
    }

    pub fn registry(&self) -> &RpcRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RpcRegistry {
        &mut self.registry
    }

    pub fn register_rpc(
        &mut self,
        address: &str,
        class_name: &str,
        entry: RpcEntry,
    ) -> Result<Option<Arc<RpcEntry>>, NetError> {
        self.registry.register(address, class_name, entry)
    }

    /// Replaces the credential check applied to `Validation` packets.
    pub fn set_validator<F>(&mut self, validator: F)
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.validator = Box::new(validator);
    }

    pub fn register_direct_handler<F>(&mut self, function_name: &str, handler: F)
    where
        F: Fn(u32, &Packet) + Send + Sync + 'static,
    {
        self.direct_handlers
            .insert(function_name.to_string(), Box::new(handler));
    }

    pub fn set_string_handler<F>(&mut self, handler: F)
    where
        F: FnMut(u32, &str) + Send + 'static,
    {
        self.string_handler = Some(Box::new(handler));
    }

    /// Opens a session: resets the game's players, opens `level`, binds the
    /// transport and spawns the host's own player at index 0.
    pub async fn create_session(
        &mut self,
        name: &str,
        game: SharedGame,
        level: &str,
        port: u16,
        max_players: usize,
    ) -> anyhow::Result<SocketAddr> {
        if self.running {
            bail!("session '{}' is already running", self.session.server_name);
        }
        if max_players == 0 {
            bail!("max_players must leave room for the host's own player");
        }

        {
            let mut g = lock_game(&game);
            g.reset_players();
            g.open_level(level);
        }

        let admission = Arc::new(Admission::new(max_players));
        for ip in &self.banned {
            admission.ban(*ip);
        }
        let local = self
            .transport
            .listen(port, admission.clone())
            .await
            .with_context(|| format!("listen on port {port}"))?;
        if admission.take_slot().is_err() {
            self.transport.shutdown();
            bail!("no slot left for the host's own player");
        }

        let address = lock_game(&game).add_player(0, &self.cfg.player_name);
        self.session = SessionInfo::new(name, level, max_players);
        self.session.insert(ConnectionRecord {
            handle: None,
            network_address: address,
            player_index: 0,
            player_name: self.cfg.player_name.clone(),
            validated: true,
            ping: 0,
        });

        self.game = Some(game);
        self.admission = Some(admission);
        self.local_addr = Some(local);
        self.running = true;
        self.ticks = 0;
        self.uptime = 0.0;
        info!(
            name,
            level,
            %local,
            max_players,
            transport = ?self.transport.kind(),
            "Session created"
        );
        self.events.push(HostEvent::SessionCreated {
            name: name.to_string(),
            local_addr: local,
        });
        Ok(local)
    }

    /// Notifies peers, closes every connection and clears the roster.
    pub fn destroy_session(&mut self) -> anyhow::Result<()> {
        if !self.running {
            bail!("no session is running");
        }
        self.flush();

        let notice = control::to_packet(
            control::SHUTDOWN,
            &Shutdown {
                reason: "session closed".to_string(),
            },
        )?
        .encode();
        let handles: Vec<ConnectionId> = self.remotes.keys().copied().collect();
        for conn in &handles {
            if let Err(e) = self.transport.send(*conn, notice.clone(), true) {
                debug!(%conn, error = %e, "Shutdown notice not sent");
            }
            self.transport.close(*conn);
        }
        self.transport.shutdown();

        for record in &self.session.players {
            self.registry.unregister_address(&record.network_address);
        }
        if let Some(game) = self.game.take() {
            let mut g = lock_game(&game);
            for record in &self.session.players {
                g.remove_player(record.player_index);
            }
        }
        let name = std::mem::take(&mut self.session.server_name);
        self.session.clear();
        self.pending.clear();
        self.remotes.clear();
        self.outbox.clear();
        self.admission = None;
        self.local_addr = None;
        self.running = false;
        info!(name = %name, closed = handles.len(), "Session destroyed");
        self.events.push(HostEvent::SessionDestroyed);
        Ok(())
    }

    /// Runs `ticks` fixed steps at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz.max(1) as f32);
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.tick(dt.as_secs_f32());
            tokio::time::sleep_until(next).await;
        }
    }

    /// One host step. Never blocks.
    pub fn tick(&mut self, dt: f32) {
        if !self.running {
            return;
        }
        self.ticks += 1;
        self.uptime += dt;

        let incoming = self.transport.poll_incoming();
        for event in self.transport.poll_events() {
            self.on_transport_event(event);
        }
        for Incoming { conn, packet } in incoming {
            self.dispatch(conn, packet);
        }
        self.expire_pending();
        self.flush();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn, remote } => {
                info!(%conn, %remote, "Connection pending validation");
                self.pending.insert(
                    conn,
                    PendingConn {
                        remote,
                        since: Instant::now(),
                    },
                );
                self.remotes.insert(conn, remote);
                self.events
                    .push(HostEvent::ConnectionPending { conn, remote });
            }
            TransportEvent::Disconnected { conn, reason } => {
                info!(%conn, %reason, "Connection dropped");
                self.end_connection(conn, CloseReason::Disconnected);
            }
            TransportEvent::Rejected { remote, reason } => {
                self.events.push(HostEvent::ConnectionRejected {
                    remote,
                    reason: reason.to_string(),
                });
            }
            TransportEvent::ConnectFailed { reason } => {
                debug!(%reason, "Ignoring connect failure on a listening transport");
            }
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, packet: Packet) {
        if self.pending.contains_key(&conn) {
            if packet.kind == PacketKind::Validation {
                self.validate(conn, &packet);
            } else {
                warn!(%conn, kind = ?packet.kind, "Packet before validation, kicking");
                self.kick_connection(conn);
            }
            return;
        }
        let Some(sender) = self.session.by_handle(conn).map(|r| r.player_index) else {
            debug!(%conn, kind = ?packet.kind, "Packet from closed connection dropped");
            return;
        };

        match packet.kind {
            PacketKind::Validation => debug!(%conn, "Repeated validation ignored"),
            PacketKind::Rpc => self.dispatch_rpc(conn, sender, &packet),
            PacketKind::DirectCall => self.dispatch_direct(conn, sender, &packet),
            PacketKind::String => {
                let text = packet.text_payload();
                debug!(player = sender, %text, "String received");
                if let Some(handler) = self.string_handler.as_mut() {
                    handler(sender, &text);
                }
                self.events
                    .push(HostEvent::StringReceived { from: sender, text });
            }
        }
    }

    fn validate(&mut self, conn: ConnectionId, packet: &Packet) {
        let request: ValidationRequest = match serde_json::from_slice(&packet.data) {
            Ok(r) => r,
            Err(e) => {
                warn!(%conn, error = %e, "Malformed validation payload, kicking");
                self.kick_connection(conn);
                return;
            }
        };
        if !(self.validator)(&request.credential) {
            warn!(%conn, "Validation rejected, kicking");
            self.kick_connection(conn);
            return;
        }
        let Some(game) = self.game.clone() else {
            return;
        };
        self.pending.remove(&conn);

        let player_index = self.session.lowest_free_index();
        let player_name = match request.player_name.trim() {
            "" => format!("Player{player_index}"),
            name => name.to_string(),
        };
        let network_address = lock_game(&game).add_player(player_index, &player_name);
        let record = ConnectionRecord {
            handle: Some(conn),
            network_address,
            player_index,
            player_name,
            validated: true,
            ping: 0,
        };
        self.session.insert(record.clone());
        self.refresh_addresses();
        let record = self
            .session
            .by_handle(conn)
            .cloned()
            .unwrap_or(record);

        info!(
            %conn,
            player = record.player_index,
            name = %record.player_name,
            address = %record.network_address,
            "Player validated"
        );
        let welcome = Welcome {
            you: record.clone(),
            session: self.session.clone(),
        };
        self.queue_control(conn, control::WELCOME, &welcome);
        self.broadcast_control(
            control::PLAYER_JOINED,
            &PlayerEvent {
                player: record.clone(),
                revision: self.session.revision,
            },
            Some(conn),
        );
        let snapshot = self.session.clone();
        self.broadcast_control(control::SESSION_INFO, &snapshot, Some(conn));
        self.events.push(HostEvent::PlayerConnected(record));
    }

    fn dispatch_rpc(&mut self, conn: ConnectionId, sender: u32, packet: &Packet) {
        let Some(entry) = self.registry.lookup_packet(packet) else {
            warn!(rpc = %RpcKey::of(packet), player = sender, "Unknown rpc dropped");
            return;
        };
        let ctx = RpcContext {
            sender: Some(sender),
            timestamp: packet.timestamp,
        };
        match entry.kind {
            DispatchKind::ClientOnly => {
                warn!(rpc = %RpcKey::of(packet), player = sender, "Client-only rpc sent to host dropped");
            }
            DispatchKind::ServerOnly => self.run_local(&entry, packet, &ctx),
            DispatchKind::ServerAndClient => {
                self.run_local(&entry, packet, &ctx);
                let bytes = packet.encode();
                let targets: Vec<ConnectionId> = self
                    .session
                    .remote_handles()
                    .filter(|h| *h != conn)
                    .collect();
                for target in targets {
                    self.queue(target, bytes.clone(), entry.reliable);
                }
            }
        }
    }

    fn run_local(&self, entry: &RpcEntry, packet: &Packet, ctx: &RpcContext) {
        if !entry.has_callback() {
            debug!(rpc = %RpcKey::of(packet), "Declared rpc has no host callback");
            return;
        }
        if let Err(e) = self.registry.invoke(entry, packet, ctx) {
            warn!(rpc = %RpcKey::of(packet), error = %e, "Rpc invoke failed");
        }
    }

    fn dispatch_direct(&mut self, conn: ConnectionId, sender: u32, packet: &Packet) {
        match packet.function_name.as_str() {
            control::PING => {
                match control::from_packet::<Ping>(packet) {
                    Ok(ping) => {
                        if let Some(record) = self.session.by_handle_mut(conn) {
                            record.ping = ping.last_rtt;
                        }
                    }
                    Err(e) => {
                        warn!(player = sender, error = %e, "Malformed ping");
                        return;
                    }
                }
                let pong = Packet::direct(control::PONG, packet.data.clone());
                self.queue(conn, pong.encode(), false);
            }
            control::SET_NAME => {
                let request: SetName = match control::from_packet(packet) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(player = sender, error = %e, "Malformed name change");
                        return;
                    }
                };
                let name = request.name.trim();
                if name.is_empty() {
                    return;
                }
                let Some(record) = self.session.by_handle_mut(conn) else {
                    return;
                };
                info!(player = sender, old = %record.player_name, new = %name, "Player renamed");
                record.player_name = name.to_string();
                let record = record.clone();
                self.session.touch();
                let snapshot = self.session.clone();
                self.broadcast_control(control::SESSION_INFO, &snapshot, None);
                self.events.push(HostEvent::PlayerRenamed(record));
            }
            name if control::is_reserved(name) => {
                debug!(player = sender, call = name, "Reserved call not handled by host");
            }
            name => match self.direct_handlers.get(name) {
                Some(handler) => handler(sender, packet),
                None => warn!(player = sender, call = name, "No direct handler registered"),
            },
        }
    }

    /// Closes whatever connection `player_index` is on.
    pub fn kick_client(&mut self, player_index: u32) -> anyhow::Result<bool> {
        let Some(record) = self.session.by_index(player_index) else {
            bail!("no player at index {player_index}");
        };
        let Some(conn) = record.handle else {
            bail!("player {player_index} is the host's own player");
        };
        Ok(self.kick_connection(conn))
    }

    /// Sends a kick notice and closes `conn`, retrying the native close up to
    /// `kick_retries` times. Validation state is cleared either way.
    /// Returns whether the transport reported the connection closed.
    pub fn kick_connection(&mut self, conn: ConnectionId) -> bool {
        if let Ok(notice) = control::to_packet(
            control::SHUTDOWN,
            &Shutdown {
                reason: "kicked".to_string(),
            },
        ) {
            if let Err(e) = self.transport.send(conn, notice.encode(), true) {
                debug!(%conn, error = %e, "Kick notice not sent");
            }
        }

        let retries = self.cfg.kick_retries.max(1);
        let mut attempts = 0;
        let mut closed = false;
        while attempts < retries {
            attempts += 1;
            if self.transport.close(conn) {
                closed = true;
                break;
            }
        }
        if !closed {
            warn!(%conn, attempts, "Kick could not close connection");
        }

        self.end_connection(conn, CloseReason::Kicked);
        closed
    }

    /// Bans `ip` and kicks every connection from it.
    pub fn ban(&mut self, ip: IpAddr) -> usize {
        self.banned.insert(ip);
        if let Some(admission) = &self.admission {
            admission.ban(ip);
        }
        let targets: Vec<ConnectionId> = self
            .remotes
            .iter()
            .filter(|(_, remote)| remote.ip() == ip)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in &targets {
            self.kick_connection(*conn);
        }
        info!(%ip, kicked = targets.len(), "Address banned");
        targets.len()
    }

    pub fn unban(&mut self, ip: IpAddr) -> bool {
        if let Some(admission) = &self.admission {
            admission.unban(ip);
        }
        self.banned.remove(&ip)
    }

    /// Clears state for a connection that is gone, however it ended.
    fn end_connection(&mut self, conn: ConnectionId, reason: CloseReason) {
        self.remotes.remove(&conn);
        if let Some(pending) = self.pending.remove(&conn) {
            self.release_slot();
            debug!(%conn, remote = %pending.remote, ?reason, "Pending connection closed");
            self.events.push(HostEvent::PendingClosed { conn, reason });
            return;
        }
        let Some(record) = self.session.by_handle(conn).cloned() else {
            return;
        };
        self.session.remove_by_index(record.player_index);
        self.release_slot();
        self.registry.unregister_address(&record.network_address);
        if let Some(game) = &self.game {
            lock_game(game).remove_player(record.player_index);
        }
        self.refresh_addresses();

        info!(
            %conn,
            player = record.player_index,
            name = %record.player_name,
            ?reason,
            "Player left"
        );
        self.broadcast_control(
            control::PLAYER_LEFT,
            &PlayerEvent {
                player: record.clone(),
                revision: self.session.revision,
            },
            None,
        );
        let snapshot = self.session.clone();
        self.broadcast_control(control::SESSION_INFO, &snapshot, None);
        self.events.push(HostEvent::PlayerDisconnected {
            player: record,
            reason,
        });
    }

    fn release_slot(&self) {
        if let Some(admission) = &self.admission {
            admission.release();
        }
    }

    /// Re-reads every player's address from the game and moves registry
    /// triples whose address changed. Moves go through a staging key first
    /// so that shifted addresses never overwrite each other.
    fn refresh_addresses(&mut self) {
        let Some(game) = &self.game else {
            return;
        };
        let mut changed = Vec::new();
        {
            let g = lock_game(game);
            for record in self.session.players.iter_mut() {
                let Some(current) = g.player_address(record.player_index) else {
                    continue;
                };
                if current != record.network_address {
                    let old = std::mem::replace(&mut record.network_address, current.clone());
                    changed.push((record.player_index, old, current));
                }
            }
        }
        for (index, old, _) in &changed {
            self.registry.remap_address(old, &format!("\u{0}remap:{index}"));
        }
        for (index, old, new) in changed {
            let moved = self
                .registry
                .remap_address(&format!("\u{0}remap:{index}"), &new);
            debug!(player = index, %old, %new, moved, "Player address changed");
        }
    }

    fn expire_pending(&mut self) {
        let limit = Duration::from_millis(self.cfg.validation_timeout_ms);
        let stale: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.since.elapsed() > limit)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in stale {
            warn!(%conn, "Validation timed out, kicking");
            self.kick_connection(conn);
        }
    }

    fn queue(&mut self, target: ConnectionId, bytes: Bytes, reliable: bool) {
        if !self.outbox.push(Outgoing {
            target,
            bytes,
            reliable,
        }) {
            warn!(dropped = self.outbox.dropped(), "Host outbox overflow");
        }
    }

    fn queue_control<T: Serialize>(&mut self, target: ConnectionId, function_name: &str, payload: &T) {
        match control::to_packet(function_name, payload) {
            Ok(packet) => self.queue(target, packet.encode(), true),
            Err(e) => warn!(call = function_name, error = %e, "Control message not encoded"),
        }
    }

    fn broadcast_control<T: Serialize>(
        &mut self,
        function_name: &str,
        payload: &T,
        except: Option<ConnectionId>,
    ) {
        let packet = match control::to_packet(function_name, payload) {
            Ok(p) => p.encode(),
            Err(e) => {
                warn!(call = function_name, error = %e, "Control message not encoded");
                return;
            }
        };
        let targets: Vec<ConnectionId> = self
            .session
            .remote_handles()
            .filter(|h| Some(*h) != except)
            .collect();
        for target in targets {
            self.queue(target, packet.clone(), true);
        }
    }

    fn flush(&mut self) {
        for out in self.outbox.drain() {
            if let Err(e) = self.transport.send(out.target, out.bytes, out.reliable) {
                debug!(conn = %out.target, error = %e, "Send failed");
            }
        }
    }

    fn outbound_rpc(
        &self,
        address: &str,
        class_name: &str,
        function_name: &str,
        args: &[Value],
    ) -> Option<(Arc<RpcEntry>, Packet)> {
        if !self.running {
            warn!(function_name, "No session running, rpc dropped");
            return None;
        }
        let Some(entry) = self.registry.lookup(address, class_name, function_name) else {
            warn!(rpc = %RpcKey::new(address, class_name, function_name), "Unknown rpc, call dropped");
            return None;
        };
        if let Err(e) = entry.check_args(args) {
            warn!(rpc = %RpcKey::new(address, class_name, function_name), error = %e, "Rpc arguments rejected");
            return None;
        }
        let packet = Packet::rpc(address, class_name, function_name, encode_args(args));
        Some((entry, packet))
    }

    /// Calls a registered RPC from the host side.
    ///
    /// `ServerOnly` runs here. `ClientOnly` goes to every peer.
    /// `ServerAndClient` runs here, then goes to every peer.
    pub fn call_rpc(
        &mut self,
        address: &str,
        class_name: &str,
        function_name: &str,
        args: &[Value],
    ) -> bool {
        let Some((entry, packet)) = self.outbound_rpc(address, class_name, function_name, args)
        else {
            return false;
        };
        let ctx = RpcContext {
            sender: None,
            timestamp: packet.timestamp,
        };
        if entry.kind.runs_on_server() {
            self.run_local(&entry, &packet, &ctx);
        }
        if entry.kind.runs_on_client() {
            let bytes = packet.encode();
            let targets: Vec<ConnectionId> = self.session.remote_handles().collect();
            for target in targets {
                self.queue(target, bytes.clone(), entry.reliable);
            }
        }
        true
    }

    /// Sends a registered RPC to one player only.
    pub fn call_rpc_on(
        &mut self,
        player_index: u32,
        address: &str,
        class_name: &str,
        function_name: &str,
        args: &[Value],
    ) -> bool {
        let Some((entry, packet)) = self.outbound_rpc(address, class_name, function_name, args)
        else {
            return false;
        };
        match self.session.by_index(player_index).map(|r| r.handle) {
            Some(Some(conn)) => {
                self.queue(conn, packet.encode(), entry.reliable);
                true
            }
            Some(None) => {
                let ctx = RpcContext {
                    sender: None,
                    timestamp: packet.timestamp,
                };
                self.run_local(&entry, &packet, &ctx);
                true
            }
            None => {
                warn!(player = player_index, function_name, "No such player, rpc dropped");
                false
            }
        }
    }

    /// Sends a direct call to one player.
    pub fn direct_call_on(&mut self, player_index: u32, function_name: &str, data: Bytes) -> bool {
        match self.session.by_index(player_index).and_then(|r| r.handle) {
            Some(conn) => {
                self.queue(conn, Packet::direct(function_name, data).encode(), true);
                true
            }
            None => {
                warn!(player = player_index, function_name, "No remote player, direct call dropped");
                false
            }
        }
    }

    /// Sends text to every player. Returns how many were targeted.
    pub fn send_string(&mut self, text: &str) -> usize {
        let bytes = Packet::text(text).encode();
        let targets: Vec<ConnectionId> = self.session.remote_handles().collect();
        for target in &targets {
            self.queue(*target, bytes.clone(), true);
        }
        targets.len()
    }

    /// Console commands for the standalone binary.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Vec::new();
        };
        match *command {
            "status" => {
                let mut out = vec![
                    format!(
                        "Session: {} running={} transport={:?}",
                        self.session.server_name,
                        self.running,
                        self.transport.kind()
                    ),
                    format!(
                        "Level: {} players={}/{} pending={} uptime={:.1}s ticks={}",
                        self.session.level_name,
                        self.session.connected_player_count,
                        self.session.max_players,
                        self.pending.len(),
                        self.uptime,
                        self.ticks
                    ),
                ];
                for p in &self.session.players {
                    let conn = p
                        .handle
                        .map_or_else(|| "local".to_string(), |h| h.to_string());
                    out.push(format!(
                        "  [{}] {} conn={} address={} ping={}ms",
                        p.player_index, p.player_name, conn, p.network_address, p.ping
                    ));
                }
                out
            }
            "kick" => match tokens.get(1).and_then(|t| t.parse::<u32>().ok()) {
                Some(index) => match self.kick_client(index) {
                    Ok(true) => vec![format!("Kicked player {index}")],
                    Ok(false) => vec![format!("Player {index} removed; close did not confirm")],
                    Err(e) => vec![format!("Kick failed: {e}")],
                },
                None => vec!["Usage: kick <player_index>".to_string()],
            },
            "ban" => match tokens.get(1).and_then(|t| t.parse::<IpAddr>().ok()) {
                Some(ip) => {
                    let kicked = self.ban(ip);
                    vec![format!("Banned {ip} ({kicked} kicked)")]
                }
                None => vec!["Usage: ban <ip>".to_string()],
            },
            "unban" => match tokens.get(1).and_then(|t| t.parse::<IpAddr>().ok()) {
                Some(ip) if self.unban(ip) => vec![format!("Unbanned {ip}")],
                Some(ip) => vec![format!("{ip} was not banned")],
                None => vec!["Usage: unban <ip>".to_string()],
            },
            "say" => {
                let text = line.trim_start().trim_start_matches("say").trim();
                if text.is_empty() {
                    return vec!["Usage: say <text>".to_string()];
                }
                let n = self.send_string(text);
                vec![format!("Sent to {n} players")]
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.destroy_session() {
                warn!(error = %e, "Destroy on drop failed");
            }
        }
    }
}
