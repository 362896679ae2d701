//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Collection a push without `collection` replaces
    pub default_collection: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let default_collection =
            env::var("DEFAULT_COLLECTION").unwrap_or_else(|_| "projects".to_string());
        if default_collection.is_empty() {
            return Err(ConfigError::EmptyDefaultCollection);
        }

        Ok(Self {
            host,
            port,
            default_collection,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            default_collection: "projects".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("DEFAULT_COLLECTION must not be empty")]
    EmptyDefaultCollection,
}
