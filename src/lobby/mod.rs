//! Lobby: player roster and challenge handshake

pub mod roster;
pub mod service;

pub use service::Lobby;
