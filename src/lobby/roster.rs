//! Lobby roster: who is connected, where they stand, and whether they are
//! in a match

use rand::Rng;
use std::collections::HashMap;

use crate::game::grid::PlacementError;
use crate::game::MatchId;
use crate::ws::protocol::{ConnectionId, PlayerInfo, Quat, Vec3};

/// Routing state of a roster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    InMatch(MatchId),
}

/// Player in the lobby
#[derive(Debug, Clone)]
pub struct LobbyPlayer {
    pub id: ConnectionId,
    pub name: String,
    pub position: Vec3,
    pub rotation: Quat,
    pub link_to_twitter: bool,
    pub status: PlayerStatus,
}

impl LobbyPlayer {
    pub fn is_playing(&self) -> bool {
        self.status != PlayerStatus::Idle
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            name: self.name.clone(),
            is_playing: self.is_playing(),
            position: self.position,
            rotation: self.rotation,
            link_to_twitter: self.link_to_twitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("connection {0} already joined the lobby")]
    AlreadyJoined(ConnectionId),

    #[error("player {0} is not in the lobby")]
    UnknownPlayer(ConnectionId),

    #[error("player {0} is already in a match")]
    AlreadyPlaying(ConnectionId),

    #[error("players cannot challenge themselves")]
    SelfChallenge,

    #[error("could not set up match: {0}")]
    Setup(#[from] PlacementError),
}

/// Random spawn point on the lobby floor
pub fn random_lobby_position<R: Rng + ?Sized>(rng: &mut R) -> Vec3 {
    Vec3 {
        x: rng.gen_range(-0.75..0.75),
        y: 0.0,
        z: rng.gen_range(-0.75..0.75),
    }
}

/// The canonical player roster
#[derive(Debug, Default)]
pub struct Roster {
    players: HashMap<ConnectionId, LobbyPlayer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player for a connection that has not joined yet
    pub fn join(
        &mut self,
        id: ConnectionId,
        name: String,
        link_to_twitter: bool,
        position: Vec3,
    ) -> Result<PlayerInfo, LobbyError> {
        if self.players.contains_key(&id) {
            return Err(LobbyError::AlreadyJoined(id));
        }
        let player = LobbyPlayer {
            id,
            name,
            position,
            rotation: Quat::IDENTITY,
            link_to_twitter,
            status: PlayerStatus::Idle,
        };
        let info = player.info();
        self.players.insert(id, player);
        Ok(info)
    }

    /// Remove a player
    pub fn leave(&mut self, id: ConnectionId) -> Option<LobbyPlayer> {
        self.players.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&LobbyPlayer> {
        self.players.get(&id)
    }

    fn get_mut(&mut self, id: ConnectionId) -> Result<&mut LobbyPlayer, LobbyError> {
        self.players.get_mut(&id).ok_or(LobbyError::UnknownPlayer(id))
    }

    pub fn move_to(&mut self, id: ConnectionId, position: Vec3) -> Result<(), LobbyError> {
        self.get_mut(id)?.position = position;
        Ok(())
    }

    pub fn rotate_to(&mut self, id: ConnectionId, rotation: Quat) -> Result<(), LobbyError> {
        self.get_mut(id)?.rotation = rotation;
        Ok(())
    }

    fn require_idle(&self, id: ConnectionId) -> Result<&LobbyPlayer, LobbyError> {
        let player = self.get(id).ok_or(LobbyError::UnknownPlayer(id))?;
        if player.is_playing() {
            return Err(LobbyError::AlreadyPlaying(id));
        }
        Ok(player)
    }

    /// Both sides must be idle lobby players, and distinct
    pub fn check_pairing(&self, attacker: ConnectionId, defender: ConnectionId) -> Result<(), LobbyError> {
        if attacker == defender {
            return Err(LobbyError::SelfChallenge);
        }
        self.require_idle(defender)?;
        self.require_idle(attacker)?;
        Ok(())
    }

    /// Mark both participants as playing `match_id`
    pub fn begin_match(
        &mut self,
        attacker: ConnectionId,
        defender: ConnectionId,
        match_id: &MatchId,
    ) -> Result<(), LobbyError> {
        self.check_pairing(attacker, defender)?;
        for id in [attacker, defender] {
            self.get_mut(id)?.status = PlayerStatus::InMatch(match_id.clone());
        }
        Ok(())
    }

    /// Return everyone still playing `match_id` to idle. Returns how many
    /// players changed.
    pub fn end_match(&mut self, match_id: &MatchId) -> usize {
        let mut released = 0;
        for player in self.players.values_mut() {
            if matches!(&player.status, PlayerStatus::InMatch(id) if id == match_id) {
                player.status = PlayerStatus::Idle;
                released += 1;
            }
        }
        released
    }

    pub fn match_of(&self, id: ConnectionId) -> Option<MatchId> {
        match &self.get(id)?.status {
            PlayerStatus::InMatch(match_id) => Some(match_id.clone()),
            PlayerStatus::Idle => None,
        }
    }

    /// Roster as sent over the wire
    pub fn snapshot(&self) -> HashMap<ConnectionId, PlayerInfo> {
        self.players.iter().map(|(id, p)| (*id, p.info())).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }
}
