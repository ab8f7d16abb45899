//! Configuration system for pvlink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/io.pvlink.pvlink/config.toml
//! - Linux: ~/.config/pvlink/config.toml
//! - Windows: %APPDATA%/pvlink/pvlink/config/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relationship record storage
    pub store: StoreConfig,
    /// Credential staging
    pub staging: StagingConfig,
    /// Remote object polling
    pub cluster: ClusterConfig,
    /// Bulk copy subprocess
    pub rsync: RsyncConfig,
    /// PSK-TLS tunnel subprocess
    pub tunnel: TunnelConfig,
}

/// Relationship store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding relationship records (uses system config dir if None)
    pub relationship_dir: Option<PathBuf>,
}

/// Credential staging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent of the per-run temporary directories (system temp dir if None)
    pub work_dir: Option<PathBuf>,
}

/// Readiness polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Interval between status reads in milliseconds
    pub poll_interval_ms: u64,
    /// How long to wait for the remote object to become ready
    pub ready_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            ready_timeout_secs: 300, // 5 minutes
        }
    }
}

impl ClusterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// rsync invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsyncConfig {
    /// Program and leading arguments used to run rsync
    pub command: Vec<String>,
    /// ssh program handed to rsync's `-e`
    pub ssh_command: String,
    /// Remote user for the ssh transport
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Preserve ACLs and extended attributes in the preserve pass
    pub preserve_acls_xattrs: bool,
    /// Names never copied or deleted
    pub excludes: Vec<String>,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            command: vec!["rsync".into()],
            ssh_command: "ssh".into(),
            ssh_user: "root".into(),
            ssh_port: 22,
            preserve_acls_xattrs: true,
            excludes: vec!["lost+found".into()],
        }
    }
}

/// stunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Program and leading arguments used to run the tunnel
    pub command: Vec<String>,
    /// Loopback port the tunnel listens on
    pub local_port: u16,
    /// Port of the remote TLS endpoint
    pub remote_port: u16,
    pub pid_poll_interval_ms: u64,
    /// Pid file checks before giving up on the tunnel
    pub pid_poll_attempts: u32,
    /// rsync daemon module exported by the remote mover
    pub rsync_module: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            command: vec!["stunnel".into()],
            local_port: 9000,
            remote_port: 8000,
            pid_poll_interval_ms: 1_000,
            pid_poll_attempts: 20,
            rsync_module: "data".into(),
        }
    }
}

impl TunnelConfig {
    pub fn pid_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pid_poll_interval_ms)
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
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml()?)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.rsync.command.is_empty() {
            return Err(Error::Config("rsync.command must not be empty".into()));
        }
        if self.tunnel.command.is_empty() {
            return Err(Error::Config("tunnel.command must not be empty".into()));
        }
        if self.tunnel.pid_poll_attempts == 0 {
            return Err(Error::Config("tunnel.pid_poll_attempts must be at least 1".into()));
        }
        if self.cluster.poll_interval_ms == 0 {
            return Err(Error::Config("cluster.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "pvlink", "pvlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the effective relationship directory (config override or system default)
    pub fn relationship_dir(&self) -> PathBuf {
        self.store
            .relationship_dir
            .clone()
            .or_else(|| {
                ProjectDirs::from("io", "pvlink", "pvlink")
                    .map(|dirs| dirs.config_dir().join("relationships"))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("pvlink").join("relationships"))
    }

    /// Render as the TOML written by `save_to`
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
