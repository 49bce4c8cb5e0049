//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Error, Result};

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Host the debuggee's debug port listens on
    #[serde(default = "default_host")]
    pub host: String,

    /// Debug port (the engine's default is 5858)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Explicit interpreter path; PATH lookup otherwise
    #[serde(default)]
    pub node: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeouts: Timeouts::default(),
            node: None,
        }
    }
}

/// Timeout settings in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Budget for validated requests (breakpoint updates, hit-count queries,
    /// exception-break configuration, source fetches)
    #[serde(default = "default_sync_request")]
    pub sync_request_ms: u64,

    /// How long a launched interpreter gets to open its debug port
    #[serde(default = "default_connect")]
    pub connect_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sync_request_ms: default_sync_request(),
            connect_ms: default_connect(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5858
}
fn default_sync_request() -> u64 {
    2000
}
fn default_connect() -> u64 {
    5000
}

impl ClientConfig {
    /// Load configuration from a TOML file
    ///
    /// Returns default configuration if no path is given or the file doesn't
    /// exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                return toml::from_str(&content).map_err(|e| Error::Config(e.to_string()));
            }
        }
        Ok(Self::default())
    }

    /// Budget for validated synchronous requests
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.sync_request_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_engine_port() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5858);
        assert_eq!(config.sync_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ClientConfig = toml::from_str("port = 9229").unwrap();
        assert_eq!(config.port, 9229);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.timeouts.sync_request_ms, 2000);
    }
}
