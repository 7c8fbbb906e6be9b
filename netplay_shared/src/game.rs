//! Game instance boundary.
//!
//! The session layer never owns gameplay state. It drives a `GameInstance`
//! through this trait: resetting the player list, opening levels, and
//! spawning/removing player actors. The address a player actor reports is
//! its logical RPC route.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Game-side collaborator bound to a host or peer.
pub trait GameInstance: Send {
    /// Removes every player actor.
    fn reset_players(&mut self);
    fn open_level(&mut self, level: &str);
    /// Returns to the front-end level after leaving a session.
    fn open_default_level(&mut self);
    fn level_name(&self) -> String;
    /// Spawns a player actor and returns its network address.
    fn add_player(&mut self, player_index: u32, name: &str) -> String;
    fn remove_player(&mut self, player_index: u32);
    /// Current network address of a player actor. May change after removals.
    fn player_address(&self, player_index: u32) -> Option<String>;
}

/// Shared handle to a game instance; host and peer in one process may share it.
pub type SharedGame = Arc<Mutex<dyn GameInstance>>;

/// Locks a game handle, recovering from poisoning.
pub fn lock_game(game: &SharedGame) -> MutexGuard<'_, dyn GameInstance + 'static> {
    game.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory game instance used by the binaries and tests.
///
/// Player addresses are `Player_<index>` and stay stable across removals.
#[derive(Debug, Clone)]
pub struct LocalGame {
    default_level: String,
    level: String,
    players: BTreeMap<u32, String>,
}

impl LocalGame {
    pub fn new(default_level: &str) -> Self {
        Self {
            default_level: default_level.to_string(),
            level: default_level.to_string(),
            players: BTreeMap::new(),
        }
    }

    pub fn shared(default_level: &str) -> SharedGame {
        Arc::new(Mutex::new(Self::new(default_level)))
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player_name(&self, player_index: u32) -> Option<&str> {
        self.players.get(&player_index).map(String::as_str)
    }
}

impl GameInstance for LocalGame {
    fn reset_players(&mut self) {
        self.players.clear();
    }

    fn open_level(&mut self, level: &str) {
        self.level = level.to_string();
    }

    fn open_default_level(&mut self) {
        self.level = self.default_level.clone();
    }

    fn level_name(&self) -> String {
        self.level.clone()
    }

    fn add_player(&mut self, player_index: u32, name: &str) -> String {
        self.players.insert(player_index, name.to_string());
        format!("Player_{player_index}")
    }

    fn remove_player(&mut self, player_index: u32) {
        self.players.remove(&player_index);
    }

    fn player_address(&self, player_index: u32) -> Option<String> {
        self.players
            .contains_key(&player_index)
            .then(|| format!("Player_{player_index}"))
    }
}
