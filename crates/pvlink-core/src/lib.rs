//! pvlink Core - Relationship records, configuration, and error types
//!
//! This crate contains the data model shared by the transfer engine and the
//! CLI. It has no dependencies on cluster APIs or subprocess code.

pub mod config;
pub mod error;
pub mod relationship;
pub mod types;

pub use config::{ClusterConfig, Config, RsyncConfig, StagingConfig, StoreConfig, TunnelConfig};
pub use error::{Error, Result};
pub use relationship::{
    validate_name, Relationship, RelationshipData, RelationshipStore, CURRENT_VERSION,
};
pub use types::*;
