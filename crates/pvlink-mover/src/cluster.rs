//! Cluster client seam
//!
//! The transfer engine only needs a handful of calls against a cluster:
//! create-or-fetch the remote destination object, read its status, delete
//! it, read secrets, and make sure the destination volume exists. One
//! [`ClusterClient`] is bound to one kube context; a [`ClusterConnector`]
//! hands them out per context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use pvlink_core::{
    AccessMode, CopyMethod, MoverSecurityContext, ObjectKey, Result, ServiceType, TransportKind,
};

/// Desired spec of a remote destination object
#[derive(Clone, Debug, PartialEq)]
pub struct DestinationSpec {
    pub transport: TransportKind,
    pub copy_method: CopyMethod,
    pub destination_pvc: Option<String>,
    pub capacity: Option<String>,
    pub access_modes: Vec<AccessMode>,
    pub storage_class_name: Option<String>,
    pub service_type: Option<ServiceType>,
    /// TLS transport only
    pub mover_security_context: Option<MoverSecurityContext>,
}

/// Destination volume to make sure of before creating the remote object
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeClaim {
    pub key: ObjectKey,
    pub capacity: Option<String>,
    pub access_modes: Vec<AccessMode>,
    pub storage_class_name: Option<String>,
}

/// Snapshot of what the remote reconciler has published
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub address: Option<String>,
    /// Secret holding the SSH keypair
    pub ssh_keys: Option<String>,
    /// Secret holding the pre-shared key
    pub key_secret: Option<String>,
}

impl RemoteStatus {
    /// Secret reference relevant to the given transport
    pub fn secret_for(&self, kind: TransportKind) -> Option<&str> {
        match kind {
            TransportKind::Ssh => self.ssh_keys.as_deref(),
            TransportKind::PskTls => self.key_secret.as_deref(),
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "<unset>".into());
        write!(
            f,
            "address={} sshKeys={} keySecret={}",
            show(&self.address),
            show(&self.ssh_keys),
            show(&self.key_secret)
        )
    }
}

/// Reference to a remote destination object
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteHandle {
    pub key: ObjectKey,
    /// Whether this invocation created the object
    pub created: bool,
    /// Last status observed for the object
    pub status: RemoteStatus,
}

/// Typed client for one cluster context
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the object, or return the existing one unmodified
    ///
    /// The returned flag is true when the object was created by this call.
    async fn create_or_get(
        &self,
        key: &ObjectKey,
        spec: &DestinationSpec,
    ) -> Result<(RemoteHandle, bool)>;

    /// Cheap status read
    async fn get_status(&self, handle: &RemoteHandle) -> Result<RemoteStatus>;

    /// Delete the object; returns false when it did not exist
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    /// Read all data entries of a secret
    async fn get_secret(&self, key: &ObjectKey) -> Result<BTreeMap<String, Vec<u8>>>;

    /// Make sure the destination volume exists; returns true when created
    async fn ensure_volume(&self, claim: &VolumeClaim) -> Result<bool>;
}

/// Produces cluster clients per kube context
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, context: &str) -> Result<Arc<dyn ClusterClient>>;
}

/// In-memory cluster that plays the part of the remote reconciler
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use pvlink_core::{Error, ObjectKey, Result, TransportKind};

    use super::*;

    #[derive(Default)]
    struct ObjectState {
        spec: Option<DestinationSpec>,
        reads: u32,
        status: RemoteStatus,
    }

    /// Scripted reconciler behaviour for newly created objects
    #[derive(Clone, Debug, Default)]
    pub struct Publish {
        /// Status reads before the address appears (None = never)
        pub address_after: Option<u32>,
        /// Status reads before the secret reference appears (None = never)
        pub secret_after: Option<u32>,
        pub address: String,
        pub secret: String,
    }

    impl Publish {
        pub fn ready_after(reads: u32) -> Self {
            Self {
                address_after: Some(reads),
                secret_after: Some(reads),
                address: "10.0.0.7".into(),
                secret: "mover-secret".into(),
            }
        }
    }

    #[derive(Default)]
    pub struct FakeCluster {
        publish: Publish,
        objects: Mutex<HashMap<ObjectKey, ObjectState>>,
        secrets: Mutex<HashMap<ObjectKey, BTreeMap<String, Vec<u8>>>>,
        volumes: Mutex<Vec<ObjectKey>>,
        pub deletes: Mutex<Vec<ObjectKey>>,
    }

    impl FakeCluster {
        pub fn new(publish: Publish) -> Self {
            Self {
                publish,
                ..Default::default()
            }
        }

        pub fn add_secret(&self, namespace: &str, name: &str, entries: &[(&str, &[u8])]) {
            let data = entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect();
            self.secrets.lock().insert(ObjectKey::new(namespace, name), data);
        }

        pub fn add_volume(&self, namespace: &str, name: &str) {
            self.volumes.lock().push(ObjectKey::new(namespace, name));
        }

        pub fn has_volume(&self, key: &ObjectKey) -> bool {
            self.volumes.lock().contains(key)
        }

        pub fn object_count(&self) -> usize {
            self.objects.lock().len()
        }

        pub fn spec_of(&self, key: &ObjectKey) -> Option<DestinationSpec> {
            self.objects.lock().get(key).and_then(|o| o.spec.clone())
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn create_or_get(
            &self,
            key: &ObjectKey,
            spec: &DestinationSpec,
        ) -> Result<(RemoteHandle, bool)> {
            let mut objects = self.objects.lock();
            let created = !objects.contains_key(key);
            let obj = objects.entry(key.clone()).or_insert_with(|| ObjectState {
                spec: Some(spec.clone()),
                ..Default::default()
            });
            let handle = RemoteHandle {
                key: key.clone(),
                created,
                status: obj.status.clone(),
            };
            Ok((handle, created))
        }

        async fn get_status(&self, handle: &RemoteHandle) -> Result<RemoteStatus> {
            let mut objects = self.objects.lock();
            let obj = objects
                .get_mut(&handle.key)
                .ok_or_else(|| Error::not_found("remote object", handle.key.to_string()))?;
            obj.reads += 1;

            if self.publish.address_after.is_some_and(|n| obj.reads > n) {
                obj.status.address = Some(self.publish.address.clone());
            }
            if self.publish.secret_after.is_some_and(|n| obj.reads > n) {
                match obj.spec.as_ref().map(|s| s.transport) {
                    Some(TransportKind::PskTls) => {
                        obj.status.key_secret = Some(self.publish.secret.clone())
                    }
                    _ => obj.status.ssh_keys = Some(self.publish.secret.clone()),
                }
            }
            Ok(obj.status.clone())
        }

        async fn delete(&self, key: &ObjectKey) -> Result<bool> {
            self.deletes.lock().push(key.clone());
            Ok(self.objects.lock().remove(key).is_some())
        }

        async fn get_secret(&self, key: &ObjectKey) -> Result<BTreeMap<String, Vec<u8>>> {
            self.secrets
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found("secret", key.to_string()))
        }

        async fn ensure_volume(&self, claim: &VolumeClaim) -> Result<bool> {
            let mut volumes = self.volumes.lock();
            if volumes.contains(&claim.key) {
                return Ok(false);
            }
            if claim.capacity.is_none() {
                return Err(Error::Config(format!(
                    "volume {} does not exist and no capacity was given",
                    claim.key
                )));
            }
            volumes.push(claim.key.clone());
            Ok(true)
        }
    }

    /// Hands out the same fake for every context
    pub struct FakeConnector {
        pub cluster: Arc<FakeCluster>,
    }

    #[async_trait]
    impl ClusterConnector for FakeConnector {
        async fn connect(&self, _context: &str) -> Result<Arc<dyn ClusterClient>> {
            Ok(self.cluster.clone())
        }
    }
}
