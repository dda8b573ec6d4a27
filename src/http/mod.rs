//! HTTP surface: health check, WebSocket endpoint and static client

pub mod routes;

pub use routes::build_router;
