//! Persistent relationship records
//!
//! Each relationship lives in its own TOML file named after the
//! relationship, inside the store directory:
//!
//! ```text
//! type = "migration"
//! id = "6f0c..."
//!
//! [data]
//! version = 2
//! transport = "psk-tls"
//!
//! [data.destination]
//! namespace = "apps"
//! rdName = "data-mig1-dst"
//! ...
//! ```
//!
//! The `data` table is versioned. Older recognized versions are upgraded in
//! memory on load and written back at [`CURRENT_VERSION`] on the next save.
//! Saving is last-writer-wins: concurrent invocations against the same
//! relationship are not serialized.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{CopyMethod, Destination, RelationshipType, Source, TransportKind};

/// Schema version written by this build
pub const CURRENT_VERSION: u32 = 2;

/// File extension of relationship records
pub const RECORD_EXTENSION: &str = "toml";

/// Maximum relationship name length
pub const MAX_NAME_LEN: usize = 63;

/// Versioned relationship payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipData {
    pub version: u32,
    /// Secure channel protocol, fixed once a destination is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
}

impl Default for RelationshipData {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            transport: None,
            source: None,
            destination: None,
        }
    }
}

impl RelationshipData {
    /// Decode a stored `data` table, upgrading older versions in memory
    ///
    /// Returns the payload together with the version it was stored at.
    pub fn decode(table: toml::Table) -> Result<(Self, u32)> {
        let stored = match table.get("version").and_then(toml::Value::as_integer) {
            Some(v) if v >= 1 => u32::try_from(v)
                .map_err(|_| Error::Config(format!("version out of range: {}", v)))?,
            Some(v) => return Err(Error::Config(format!("invalid version: {}", v))),
            None => return Err(Error::Config("relationship data has no version".into())),
        };

        if stored > CURRENT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: stored,
                supported: CURRENT_VERSION,
            });
        }

        let mut data: RelationshipData = toml::Value::Table(table).try_into()?;

        if stored == 1 {
            data.upgrade_v1();
        }

        if data.destination.is_some() && data.transport.is_none() {
            return Err(Error::Config(
                "destination is defined but transport is missing".into(),
            ));
        }

        Ok((data, stored))
    }

    /// Version 1 records predate the TLS transport and explicit copy methods
    fn upgrade_v1(&mut self) {
        if self.transport.is_none() {
            self.transport = Some(TransportKind::Ssh);
        }
        if let Some(dest) = self.destination.as_mut() {
            if dest.copy_method.is_none() {
                dest.copy_method = Some(CopyMethod::Direct);
            }
        }
        self.version = CURRENT_VERSION;
    }

    pub fn encode(&self) -> Result<toml::Table> {
        match toml::Value::try_from(self)? {
            toml::Value::Table(t) => Ok(t),
            other => Err(Error::Config(format!(
                "relationship data encoded as {}",
                other.type_str()
            ))),
        }
    }
}

/// On-disk shape of a record
#[derive(Serialize, Deserialize)]
struct RecordFile {
    #[serde(rename = "type")]
    kind: String,
    id: Uuid,
    data: toml::Table,
}

/// A named transfer relationship bound to its backing file
#[derive(Clone, Debug)]
pub struct Relationship {
    name: String,
    kind: RelationshipType,
    id: Uuid,
    data: RelationshipData,
    path: PathBuf,
    loaded_version: Option<u32>,
}

impl Relationship {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationshipType {
        self.kind
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &RelationshipData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut RelationshipData {
        &mut self.data
    }

    pub fn set_data(&mut self, data: RelationshipData) {
        self.data = data;
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.data.transport
    }

    /// Version the record had on disk, if it was loaded
    pub fn loaded_version(&self) -> Option<u32> {
        self.loaded_version
    }

    /// Render the full record as it would be written to disk
    pub fn to_toml(&self) -> Result<String> {
        let mut data = self.data.clone();
        data.version = CURRENT_VERSION;
        let record = RecordFile {
            kind: self.kind.as_str().to_string(),
            id: self.id,
            data: data.encode()?,
        };
        Ok(toml::to_string_pretty(&record)?)
    }

    /// Write the full record back to its file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.path, self.to_toml()?)?;

        info!("Saved relationship {} to {:?}", self.name, self.path);
        Ok(())
    }

    /// Remove the backing file
    pub fn delete(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted relationship {}", self.name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found("relationship", self.name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Directory of relationship records
#[derive(Clone, Debug)]
pub struct RelationshipStore {
    dir: PathBuf,
}

impl RelationshipStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `name`
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, RECORD_EXTENSION)))
    }

    /// Start a new, empty relationship
    ///
    /// Nothing is written until [`Relationship::save`] is called.
    pub fn create(&self, name: &str, kind: RelationshipType) -> Result<Relationship> {
        let path = self.path_for(name)?;
        if path.exists() {
            return Err(Error::already_exists("relationship", name));
        }

        let id = Uuid::new_v4();
        debug!("Creating {} relationship {} ({})", kind, name, id);

        Ok(Relationship {
            name: name.to_string(),
            kind,
            id,
            data: RelationshipData::default(),
            path,
            loaded_version: None,
        })
    }

    /// Load an existing relationship, checking its type tag
    pub fn load(&self, name: &str, expected: RelationshipType) -> Result<Relationship> {
        let path = self.path_for(name)?;

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::not_found("relationship", name));
            }
            Err(e) => return Err(e.into()),
        };

        let record: RecordFile = toml::from_str(&content)?;

        if record.kind != expected.as_str() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                found: record.kind,
            });
        }

        let (data, stored) = RelationshipData::decode(record.data)?;
        if stored != CURRENT_VERSION {
            info!(
                "Upgraded relationship {} from version {} to {}",
                name, stored, CURRENT_VERSION
            );
        }

        Ok(Relationship {
            name: name.to_string(),
            kind: expected,
            id: record.id,
            data,
            path,
            loaded_version: Some(stored),
        })
    }

    /// Names of all stored relationships, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Check a relationship name is usable as a file stem
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Config(format!(
            "relationship name must be 1-{} characters: {:?}",
            MAX_NAME_LEN, name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::Config(format!(
            "relationship name must not start with '.': {:?}",
            name
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::Config(format!(
            "relationship name may only contain letters, digits, '-', '_' and '.': {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, MoverSecurityContext, ServiceType};
    use tempfile::TempDir;

    fn sample_destination() -> Destination {
        Destination {
            cluster: "east".into(),
            namespace: "apps".into(),
            rd_name: "data-mig-dst".into(),
            pvc_name: "data".into(),
            copy_method: Some(CopyMethod::Direct),
            capacity: Some("2Gi".into()),
            access_modes: vec![AccessMode::ReadWriteOnce],
            storage_class_name: Some("fast".into()),
            service_type: Some(ServiceType::LoadBalancer),
            mover_security_context: Some(MoverSecurityContext {
                run_as_user: Some(1000),
                ..Default::default()
            }),
            address: Some("10.1.2.3".into()),
            ssh_key_secret_name: None,
            psk_secret_name: Some("psk-secret".into()),
        }
    }

    #[test]
    fn test_create_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());

        let mut rel = store.create("mig", RelationshipType::Migration).unwrap();
        rel.data_mut().transport = Some(TransportKind::PskTls);
        rel.data_mut().destination = Some(sample_destination());
        rel.save().unwrap();

        let loaded = store.load("mig", RelationshipType::Migration).unwrap();
        assert_eq!(loaded.id(), rel.id());
        assert_eq!(loaded.data(), rel.data());
        assert_eq!(loaded.loaded_version(), Some(CURRENT_VERSION));
    }

    #[test]
    fn test_create_fails_when_record_exists() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());

        store.create("mig", RelationshipType::Migration).unwrap().save().unwrap();
        let err = store.create("mig", RelationshipType::Migration).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        let err = store.load("nope", RelationshipType::Migration).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_type_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        store.create("rep", RelationshipType::Replication).unwrap().save().unwrap();

        let err = store.load("rep", RelationshipType::Migration).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_v1_record_is_upgraded() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        let v1 = r#"
            type = "migration"
            id = "0b5bd5f4-4f9b-4c0e-8f1e-7d1d8c1e2a3b"

            [data]
            version = 1

            [data.destination]
            cluster = ""
            namespace = "apps"
            rdName = "data-old-dst"
            pvcName = "data"
            address = "10.0.0.9"
            sshKeySecretName = "old-keys"
        "#;
        fs::write(dir.path().join("old.toml"), v1).unwrap();

        let rel = store.load("old", RelationshipType::Migration).unwrap();
        assert_eq!(rel.loaded_version(), Some(1));
        assert_eq!(rel.data().version, CURRENT_VERSION);
        assert_eq!(rel.transport(), Some(TransportKind::Ssh));
        let dest = rel.data().destination.as_ref().unwrap();
        assert_eq!(dest.copy_method, Some(CopyMethod::Direct));
        assert_eq!(dest.ssh_key_secret_name.as_deref(), Some("old-keys"));

        // Saved at the current version and stable from then on
        rel.save().unwrap();
        let again = store.load("old", RelationshipType::Migration).unwrap();
        assert_eq!(again.loaded_version(), Some(CURRENT_VERSION));
        assert_eq!(again.data(), rel.data());
    }

    #[test]
    fn test_newer_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        let future = r#"
            type = "migration"
            id = "0b5bd5f4-4f9b-4c0e-8f1e-7d1d8c1e2a3b"

            [data]
            version = 7
        "#;
        fs::write(dir.path().join("future.toml"), future).unwrap();

        let err = store.load("future", RelationshipType::Migration).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { found: 7, .. }));
    }

    #[test]
    fn test_missing_transport_at_current_version() {
        let table: toml::Table = toml::from_str(
            r#"
            version = 2
            [destination]
            namespace = "apps"
            rdName = "x"
            "#,
        )
        .unwrap();
        assert!(RelationshipData::decode(table).unwrap_err().is_config());
    }

    #[test]
    fn test_delete_twice() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        let rel = store.create("gone", RelationshipType::PvBackup).unwrap();
        rel.save().unwrap();

        rel.clone().delete().unwrap();
        assert!(rel.delete().unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_sorted() {
        let dir = TempDir::new().unwrap();
        let store = RelationshipStore::new(dir.path());
        for name in ["zeta", "alpha", "mid"] {
            store.create(name, RelationshipType::Migration).unwrap().save().unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_list_missing_dir() {
        let store = RelationshipStore::new("/nonexistent/pvlink/relationships");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("mig-1_a.b").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }
}
