//! Represents the SSH settings used for remote connections.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// SSH defaults for remote connections.
///
/// Every field is optional in the configuration file; whatever a host
/// identifier (`user@host:port`) or `~/.ssh/config` provides takes precedence
/// over these defaults.
///
/// # Fields
///
/// - `username`: Login used when neither the host identifier nor the ssh config names one.
/// - `port`: SSH port used when neither the host identifier nor the ssh config names one.
/// - `password`: An optional password, tried after agent and key authentication.
/// - `private_key_path`: An optional private key tried before any ssh config `IdentityFile`.
/// - `ssh_config`: The ssh config file to read (defaults to `~/.ssh/config`).
/// - `max_retries`: The maximum number of TCP connection retry attempts.
/// - `timeout`: The connection (TCP connect and handshake) timeout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub username: Option<String>,
    pub port: u16,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub ssh_config: Option<PathBuf>,
    pub max_retries: u8,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: None,
            port: 22,
            password: None,
            private_key_path: None,
            ssh_config: None,
            max_retries: 3,
            timeout: Duration::from_secs(15),
        }
    }
}

impl ConnectionConfig {
    /// Login name used when nothing more specific is configured.
    pub fn default_username(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    /// The ssh config file to consult for host aliases.
    pub fn ssh_config_path(&self) -> Option<PathBuf> {
        self.ssh_config
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("config")))
    }
}
