//! Core type definitions for pvlink
//!
//! These types describe the two ends of a transfer relationship and are
//! persisted verbatim inside the relationship record.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a Kubernetes object name we generate
pub const MAX_OBJECT_NAME_LEN: usize = 63;

/// Kind of relationship stored in a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    Migration,
    Replication,
    PvBackup,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Replication => "replication",
            Self::PvBackup => "pv-backup",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "migration" => Ok(Self::Migration),
            "replication" => Ok(Self::Replication),
            "pv-backup" => Ok(Self::PvBackup),
            _ => Err(format!("Unknown relationship type: {}", s)),
        }
    }
}

/// Secure channel protocol used by a relationship
///
/// Fixed once a destination has been attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// rsync over ssh, host key pinned from the destination secret
    Ssh,
    /// rsync daemon protocol through a pre-shared-key TLS tunnel
    PskTls,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::PskTls => write!(f, "psk-tls"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" | "rsync" => Ok(Self::Ssh),
            "psk-tls" | "tls" | "rsync-tls" => Ok(Self::PskTls),
            _ => Err(format!("Unknown transport: {}", s)),
        }
    }
}

/// How the destination volume is populated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CopyMethod {
    /// Write straight into the destination PVC
    #[default]
    Direct,
    None,
    Clone,
    Snapshot,
}

impl fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "Direct",
            Self::None => "None",
            Self::Clone => "Clone",
            Self::Snapshot => "Snapshot",
        };
        f.write_str(s)
    }
}

impl FromStr for CopyMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "none" => Ok(Self::None),
            "clone" => Ok(Self::Clone),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(format!("Unknown copy method: {}", s)),
        }
    }
}

/// Service exposing the remote mover
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    ClusterIP,
    LoadBalancer,
    NodePort,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClusterIP => "ClusterIP",
            Self::LoadBalancer => "LoadBalancer",
            Self::NodePort => "NodePort",
        };
        f.write_str(s)
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clusterip" => Ok(Self::ClusterIP),
            "loadbalancer" => Ok(Self::LoadBalancer),
            "nodeport" => Ok(Self::NodePort),
            _ => Err(format!("Unknown service type: {}", s)),
        }
    }
}

/// Persistent volume access mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWriteOnce => "ReadWriteOnce",
            Self::ReadOnlyMany => "ReadOnlyMany",
            Self::ReadWriteMany => "ReadWriteMany",
            Self::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReadWriteOnce" | "RWO" => Ok(Self::ReadWriteOnce),
            "ReadOnlyMany" | "ROX" => Ok(Self::ReadOnlyMany),
            "ReadWriteMany" | "RWX" => Ok(Self::ReadWriteMany),
            "ReadWriteOncePod" | "RWOP" => Ok(Self::ReadWriteOncePod),
            _ => Err(format!("Unknown access mode: {}", s)),
        }
    }
}

/// Pod security context applied to the TLS mover
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoverSecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
}

impl MoverSecurityContext {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Namespaced name of a remote object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Destination side of a relationship
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Kube context of the destination cluster (empty = default)
    #[serde(default)]
    pub cluster: String,
    pub namespace: String,
    /// Name of the remote ReplicationDestination
    pub rd_name: String,
    /// Volume the data lands in
    #[serde(default)]
    pub pvc_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_method: Option<CopyMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<AccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    /// Only honoured by the TLS transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mover_security_context: Option<MoverSecurityContext>,

    // Populated once the remote object reports ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk_secret_name: Option<String>,
}

impl Destination {
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.rd_name)
    }

    pub fn copy_method(&self) -> CopyMethod {
        self.copy_method.unwrap_or_default()
    }

    /// Secret reference recorded for the given transport
    pub fn secret_name(&self, kind: TransportKind) -> Option<&str> {
        match kind {
            TransportKind::Ssh => self.ssh_key_secret_name.as_deref(),
            TransportKind::PskTls => self.psk_secret_name.as_deref(),
        }
    }

    /// Forget status copied from a previous incarnation of the remote object
    pub fn clear_status(&mut self) {
        self.address = None;
        self.ssh_key_secret_name = None;
        self.psk_secret_name = None;
    }
}

/// Source side of a relationship
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,
    /// Local directory for migrations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_method: Option<CopyMethod>,
}

/// Generate the remote object name for a destination volume
///
/// Kubernetes names are capped at 63 characters; trailing separators left
/// by truncation are trimmed.
pub fn remote_object_name(pvc_name: &str, relationship: &str) -> String {
    let mut name = format!("{}-{}-dst", pvc_name, relationship);
    if name.len() > MAX_OBJECT_NAME_LEN {
        let mut end = MAX_OBJECT_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name.trim_end_matches(['-', '.']).to_string()
}

/// Check that `value` is a DNS-1123 label, the form Kubernetes requires
/// for namespaces and volume claim names
pub fn validate_dns_label(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_OBJECT_NAME_LEN {
        return Err(Error::Config(format!(
            "{} must be 1-{} characters: {:?}",
            what, MAX_OBJECT_NAME_LEN, value
        )));
    }
    let allowed = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !allowed || value.starts_with('-') || value.ends_with('-') {
        return Err(Error::Config(format!(
            "{} must consist of lower case alphanumerics or '-', and start and end with an alphanumeric: {:?}",
            what, value
        )));
    }
    Ok(())
}
