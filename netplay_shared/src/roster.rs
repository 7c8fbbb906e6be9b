//! Player roster and session snapshot types.

use serde::{Deserialize, Serialize};

use crate::transport::ConnectionId;

/// One player known to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Transport handle; `None` for the host's own local player.
    pub handle: Option<ConnectionId>,
    /// Logical per-actor route, distinct from the transport handle.
    pub network_address: String,
    pub player_index: u32,
    pub player_name: String,
    pub validated: bool,
    /// Last reported round-trip latency in milliseconds.
    pub ping: u64,
}

/// Snapshot of a running session, broadcast on every roster change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub server_name: String,
    pub level_name: String,
    pub max_players: usize,
    pub connected_player_count: usize,
    /// Sorted by `player_index`.
    pub players: Vec<ConnectionRecord>,
    /// Bumped on every roster change. Peers drop anything older than what
    /// they already applied.
    #[serde(default)]
    pub revision: u64,
}

impl SessionInfo {
    pub fn new(server_name: &str, level_name: &str, max_players: usize) -> Self {
        Self {
            server_name: server_name.to_string(),
            level_name: level_name.to_string(),
            max_players,
            connected_player_count: 0,
            players: Vec::new(),
            revision: 0,
        }
    }

    /// Smallest index not held by any player.
    pub fn lowest_free_index(&self) -> u32 {
        // `players` is sorted, so the first gap is the answer.
        let mut candidate = 0;
        for p in &self.players {
            if p.player_index == candidate {
                candidate += 1;
            } else if p.player_index > candidate {
                break;
            }
        }
        candidate
    }

    /// Inserts keeping `players` sorted by index.
    pub fn insert(&mut self, record: ConnectionRecord) {
        let pos = self
            .players
            .partition_point(|p| p.player_index < record.player_index);
        self.players.insert(pos, record);
        self.connected_player_count = self.players.len();
        self.revision += 1;
    }

    pub fn remove_by_index(&mut self, player_index: u32) -> Option<ConnectionRecord> {
        let pos = self
            .players
            .iter()
            .position(|p| p.player_index == player_index)?;
        let record = self.players.remove(pos);
        self.connected_player_count = self.players.len();
        self.revision += 1;
        Some(record)
    }

    /// Marks an in-place change to a record, such as a rename.
    pub fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn by_handle(&self, handle: ConnectionId) -> Option<&ConnectionRecord> {
        self.players.iter().find(|p| p.handle == Some(handle))
    }

    pub fn by_handle_mut(&mut self, handle: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.players.iter_mut().find(|p| p.handle == Some(handle))
    }

    pub fn by_index(&self, player_index: u32) -> Option<&ConnectionRecord> {
        self.players.iter().find(|p| p.player_index == player_index)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Handles of every remote player, in index order.
    pub fn remote_handles(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.players.iter().filter_map(|p| p.handle)
    }

    pub fn clear(&mut self) {
        self.players.clear();
        self.connected_player_count = 0;
        self.revision += 1;
    }
}
