//! Configuration system for Courier
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/courier/config.toml
//! - Linux: ~/.config/courier/config.toml
//! - Windows: %APPDATA%/courier/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::permission::PermissionBackend;
use crate::types::NodeRole;
use crate::DEFAULT_PIPE_CAPACITY;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer tuning
    pub transfer: TransferConfig,
    /// How permission bits are restored
    pub permissions: PermissionConfig,
    /// Settings for `courier worker`
    pub worker: WorkerConfig,
    /// Content provider used by `courier fetch`
    pub provider: ProviderConfig,
    /// Workspace layout for hook stages
    pub stages: StageConfig,
    /// Known nodes, addressable by name
    pub nodes: Vec<NodeConfig>,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Buffer size of in-process pipes in bytes
    pub pipe_capacity: usize,
    /// Upper bound on waiting for the remote half once the local half is done
    pub remote_timeout_secs: u64,
    /// How long to wait for the remote result after a local failure
    pub failure_grace_secs: u64,
    /// Default for requests that don't say otherwise
    pub honor_default_excludes: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            remote_timeout_secs: 3600,
            failure_grace_secs: 3,
            honor_default_excludes: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub backend: PermissionBackend,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name announced in logs (hostname if unset)
    pub name: Option<String>,
    /// Bind address
    pub bind: IpAddr,
    /// QUIC port
    pub port: u16,
    /// Concurrent transfers served
    pub max_connections: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7433,
            max_connections: 16,
        }
    }
}

/// A node the coordinator can send work to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// `host:port` of the worker; absent means an in-process node
    #[serde(default)]
    pub address: Option<String>,
    /// Name presented in the TLS handshake
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub role: NodeRole,
}

fn default_server_name() -> String {
    "localhost".into()
}

/// Content provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Service address list, `ip:port[,ip:port...]`
    pub address: Option<String>,
    /// Node under which includes are resolved
    pub base_path: String,
    /// Local directory mirroring the provider namespace
    pub mirror: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            address: None,
            base_path: "/".into(),
            mirror: None,
        }
    }
}

/// Workspace layout used by hook stages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Overrides `<project_root>/workspace`
    pub custom_workspace: Option<PathBuf>,
    pub project_root: PathBuf,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            custom_workspace: None,
            project_root: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "courier", "courier")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Look up a configured node by name
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let mut config = Self::default();
        config.nodes.push(NodeConfig {
            name: "builder-1".into(),
            address: Some("10.0.0.21:7433".into()),
            server_name: default_server_name(),
            role: NodeRole::Worker,
        });
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
