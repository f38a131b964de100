//! Represents the harness-wide settings file.

use crate::config::connection_config::ConnectionConfig;
use crate::utils;
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default core network registry file.
pub const DEFAULT_REGISTRY: &str = "ci_infra.yaml";

/// Default remote directory log collection stages files in.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/cn-undeploy-logs";

/// This struct is deserialized from a TOML file with `utils::read_toml_from_file`.
/// All fields are optional:
/// - `registry`: The core network registry (YAML).
/// - `scripts_dir`: The directory `!script` commands and `ranci script` resolve names in.
/// - `command_timeout`: Timeout of a single command run from the command line.
/// - `script_timeout`: Timeout of a script started from a core network command sequence.
/// - `scratch_dir`: Remote directory logs are staged in during undeploy.
/// - `connection`: SSH defaults, see `ConnectionConfig`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub registry: PathBuf,
    pub scripts_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub script_timeout: Duration,
    pub scratch_dir: String,
    pub connection: ConnectionConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            registry: PathBuf::from(DEFAULT_REGISTRY),
            scripts_dir: PathBuf::from("scripts"),
            command_timeout: Duration::from_secs(300),
            script_timeout: Duration::from_secs(300),
            scratch_dir: DEFAULT_SCRATCH_DIR.to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Reads the settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        utils::read_toml_from_file(path)
    }
}
