use crate::keystore::DEFAULT_CACHE_CAPACITY;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 32597;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid client pattern {pattern:?}: {reason}")]
    InvalidClientPattern { pattern: String, reason: String },

    #[error("Key cache capacity cannot be 0")]
    ZeroCacheCapacity,

    #[error("Watcher interval cannot be 0")]
    ZeroWatcherInterval,
}

/// Statistics server configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Address the datagram socket is bound to
    #[serde(default)]
    pub listener: Listener,
    /// Statistics database
    pub database: DatabaseConfig,
    /// Host name patterns allowed to submit data, in match order.
    ///
    /// Shell glob syntax (`*`, `?`, `[...]`). An empty list authorizes every
    /// host.
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub key_cache: KeyCacheConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.database.path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyDatabasePath);
        }

        for pattern in &self.clients {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ValidationError::InvalidClientPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if self.key_cache.capacity == 0 {
            return Err(ValidationError::ZeroCacheCapacity);
        }

        if self.watcher.interval_secs == 0 {
            return Err(ValidationError::ZeroWatcherInterval);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "::")
    #[serde(default = "default_host")]
    pub host: String,
    /// UDP port number to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: default_host(),
            port: DEFAULT_PORT,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// SQLite database file, created on first start
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct KeyCacheConfig {
    /// Maximum number of surrogate keys held in memory
    pub capacity: u64,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        KeyCacheConfig {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WatcherConfig {
    pub interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig { interval_secs: 60 }
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
