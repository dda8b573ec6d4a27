//! WebSocket transport: upgrade handler, wire protocol and outbound routing

pub mod handler;
pub mod hub;
pub mod protocol;
