//! Error types for pvlink
//!
//! One variant per failure class of the transfer workflow. Errors raised
//! while cleaning up (`Cleanup`) are only ever logged by callers.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the workspace
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Workflow-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed relationship record or configuration file
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported relationship version {found} (newest known is {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("relationship {name} is of type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// Failure talking to the cluster API
    #[error("remote API error: {0}")]
    RemoteApi(String),

    #[error("timed out after {elapsed:?} waiting for {object} (last status: {last_status})")]
    Timeout {
        object: String,
        elapsed: Duration,
        last_status: String,
    },

    #[error("tunnel failed to start: {0}")]
    TunnelStartup(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("credential staging failed: {0}")]
    Staging(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            what,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether the error stems from the relationship record itself
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnsupportedVersion { .. } | Error::TypeMismatch { .. }
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
