//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::game::MatchConfig;
use crate::ws::protocol::ShipType;

/// Largest grid a client can address with a single letter per column
pub const MAX_GRID_SIZE: usize = 26;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Side length of every match grid
    pub grid_size: usize,
    /// Fire for a stalled player after this long
    pub turn_timeout: Option<Duration>,

    /// Built web client, served at `/` when set
    pub client_dir: Option<PathBuf>,
    /// Allowed client origins for CORS; any origin when empty
    pub client_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // PORT wins (hosting platforms set it), then SERVER_ADDR
        let server_addr = match var("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => var("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
        };

        let grid_size = match var("GRID_SIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::Invalid("GRID_SIZE"))?,
            None => 6,
        };
        let longest = ShipType::Carrier.size();
        if !(longest..=MAX_GRID_SIZE).contains(&grid_size) {
            return Err(ConfigError::GridSize(grid_size, longest, MAX_GRID_SIZE));
        }

        let turn_timeout = match var("TURN_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid("TURN_TIMEOUT_SECS"))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            grid_size,
            turn_timeout,

            client_dir: var("CLIENT_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            client_origins: var("CLIENT_ORIGIN")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Settings handed to every new match
    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            grid_size: self.grid_size,
            turn_timeout: self.turn_timeout,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("GRID_SIZE {0} out of range, must be between {1} and {2}")]
    GridSize(usize, usize, usize),

    #[error("Invalid server address format")]
    InvalidAddress,
}
