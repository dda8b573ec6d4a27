//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::MatchRegistry;
use crate::lobby::Lobby;
use crate::ws::hub::ConnectionHub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<ConnectionHub>,
    pub match_registry: Arc<MatchRegistry>,
    pub lobby: Arc<Lobby>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Outboxes of every live connection
        let hub = Arc::new(ConnectionHub::new());

        // Initialize match registry
        let match_registry = Arc::new(MatchRegistry::new());

        let lobby = Arc::new(Lobby::new(
            hub.clone(),
            match_registry.clone(),
            config.match_config(),
        ));

        Self {
            config,
            hub,
            match_registry,
            lobby,
        }
    }
}
