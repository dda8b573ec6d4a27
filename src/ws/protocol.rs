//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral identifier assigned to a connection when it upgrades
pub type ConnectionId = Uuid;

/// Ship classes in a fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipType {
    Carrier,
    Battleship,
    Cruiser,
    Submarine,
}

impl ShipType {
    /// Number of contiguous cells the ship occupies
    pub const fn size(self) -> usize {
        match self {
            Self::Carrier => 5,
            Self::Battleship => 4,
            Self::Cruiser => 3,
            Self::Submarine => 3,
        }
    }
}

/// Axis a ship extends along from its start cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Cells advance along `x`
    Horizontal,
    /// Cells advance along `y`
    Vertical,
}

/// Grid cell coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: usize,
    pub y: usize,
}

/// A placed ship, as sent to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ship {
    #[serde(rename = "type")]
    pub ship_type: ShipType,
    pub start: Coord,
    pub direction: Direction,
}

impl Ship {
    /// Every cell covered by the ship, starting at `start`
    pub fn cells(&self) -> impl Iterator<Item = Coord> + '_ {
        (0..self.ship_type.size()).map(move |i| match self.direction {
            Direction::Horizontal => Coord {
                x: self.start.x + i,
                y: self.start.y,
            },
            Direction::Vertical => Coord {
                x: self.start.x,
                y: self.start.y + i,
            },
        })
    }

    pub fn covers(&self, cell: Coord) -> bool {
        self.cells().any(|c| c == cell)
    }
}

/// Lobby position
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Lobby orientation quaternion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// How a match ended for one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Win,
    Lose,
    Forfeit,
    Disconnect,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Enter the lobby
    Login {
        name: String,
        #[serde(default)]
        link_to_twitter: bool,
    },

    /// Lobby presence: new position
    Move { position: Vec3 },

    /// Lobby presence: new orientation
    Rotate { quaternion: Quat },

    /// Challenge another lobby player
    Challenge { player_id: ConnectionId },

    /// Accept a challenge from `player_id`
    Accept { player_id: ConnectionId },

    /// Fire at the opponent's grid. Signed so that negative input can be
    /// rejected instead of failing to parse.
    Fire { x: i64, y: i64 },

    /// Give up the current match
    Forfeit,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        connection_id: ConnectionId,
        server_time: u64,
    },

    /// Sent once to a player that logged in
    InitPlayer { player: PlayerInfo },

    /// Full roster, sent to everyone on any roster change
    UpdatePlayers {
        players: HashMap<ConnectionId, PlayerInfo>,
    },

    /// Sent only to the challenged player
    Challenge { attacker: ConnectionId },

    StartGame {
        attacker: ConnectionId,
        defender: ConnectionId,
    },

    /// The receiving participant's own fleet
    InitShips { ships: Vec<Ship> },

    YourTurn,

    EndTurn,

    /// Outcome of a shot, sent to both participants
    Result(ShotResult),

    GameOver {
        end_state: HashMap<ConnectionId, EndReason>,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Player info for the lobby roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: ConnectionId,
    pub name: String,
    pub is_playing: bool,
    pub position: Vec3,
    pub rotation: Quat,
    pub link_to_twitter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotResult {
    pub fired_by: ConnectionId,
    pub x: usize,
    pub y: usize,
    pub hit: bool,
    /// Set when this hit sank the last intact cell of a ship
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunk: Option<ShipType>,
}
