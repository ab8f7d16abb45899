//! Kubernetes-backed cluster client
//!
//! The remote destination object is a volsync `ReplicationDestination`. Its
//! `rsync` block drives the ssh mover, its `rsyncTLS` block the TLS mover;
//! exactly one of them is set. The reconciler publishes the mover address and
//! the secret holding the credentials under the matching status block.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pvlink_core::{AccessMode, Error, MoverSecurityContext, ObjectKey, Result, TransportKind};

use crate::cluster::{
    ClusterClient, ClusterConnector, DestinationSpec, RemoteHandle, RemoteStatus, VolumeClaim,
};

/// Remote destination for replicated data
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, Clone, JsonSchema)]
#[kube(
    group = "volsync.backube",
    version = "v1alpha1",
    kind = "ReplicationDestination",
    status = "ReplicationDestinationStatus",
    namespaced
)]
pub struct ReplicationDestinationSpec {
    /// ssh mover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<RsyncDestination>,
    /// PSK TLS mover
    #[serde(default, rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<RsyncDestination>,
}

/// Volume and mover options shared by both movers
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RsyncDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, rename = "destinationPVC", skip_serializing_if = "Option::is_none")]
    pub destination_pvc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mover_security_context: Option<PodSecurity>,
}

/// Subset of the pod security context the mover honours
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
}

impl From<&MoverSecurityContext> for PodSecurity {
    fn from(ctx: &MoverSecurityContext) -> Self {
        Self {
            run_as_user: ctx.run_as_user,
            run_as_group: ctx.run_as_group,
            fs_group: ctx.fs_group,
            run_as_non_root: ctx.run_as_non_root,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, JsonSchema)]
pub struct ReplicationDestinationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<MoverStatus>,
    #[serde(default, rename = "rsyncTLS", skip_serializing_if = "Option::is_none")]
    pub rsync_tls: Option<MoverStatus>,
}

/// What the reconciler publishes once the mover is reachable
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoverStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,
}

/// Build the object to create for `spec`
pub fn build_destination(key: &ObjectKey, spec: &DestinationSpec) -> ReplicationDestination {
    let mut mover = RsyncDestination {
        copy_method: Some(spec.copy_method.to_string()),
        capacity: spec.capacity.clone(),
        access_modes: spec
            .access_modes
            .iter()
            .map(|m| m.as_str().to_string())
            .collect(),
        storage_class_name: spec.storage_class_name.clone(),
        destination_pvc: spec.destination_pvc.clone(),
        service_type: spec.service_type.map(|t| t.to_string()),
        mover_security_context: None,
    };

    let body = match spec.transport {
        TransportKind::Ssh => ReplicationDestinationSpec {
            rsync: Some(mover),
            rsync_tls: None,
        },
        TransportKind::PskTls => {
            mover.mover_security_context = spec.mover_security_context.as_ref().map(PodSecurity::from);
            ReplicationDestinationSpec {
                rsync: None,
                rsync_tls: Some(mover),
            }
        }
    };

    let mut rd = ReplicationDestination::new(&key.name, body);
    rd.metadata.namespace = Some(key.namespace.clone());
    rd
}

/// Flatten whichever mover status block is present
pub fn status_of(rd: &ReplicationDestination) -> RemoteStatus {
    let Some(status) = rd.status.as_ref() else {
        return RemoteStatus::default();
    };

    let mut out = RemoteStatus::default();
    if let Some(ssh) = status.rsync.as_ref() {
        out.address = ssh.address.clone();
        out.ssh_keys = ssh.ssh_keys.clone();
    }
    if let Some(tls) = status.rsync_tls.as_ref() {
        if out.address.is_none() {
            out.address = tls.address.clone();
        }
        out.key_secret = tls.key_secret.clone();
    }
    out
}

/// Build the volume claim to create when the destination volume is missing
pub fn build_claim(claim: &VolumeClaim) -> Result<PersistentVolumeClaim> {
    let capacity = claim.capacity.as_ref().ok_or_else(|| {
        Error::Config(format!(
            "volume {} does not exist and no capacity was given",
            claim.key
        ))
    })?;

    let modes = if claim.access_modes.is_empty() {
        vec![AccessMode::ReadWriteOnce.as_str().to_string()]
    } else {
        claim.access_modes.iter().map(|m| m.as_str().to_string()).collect()
    };

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.key.name.clone()),
            namespace: Some(claim.key.namespace.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(modes),
            storage_class_name: claim.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(capacity.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn api_error(action: &str, key: &ObjectKey, e: kube::Error) -> Error {
    Error::RemoteApi(format!("{} {}: {}", action, key, e))
}

fn has_code(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

/// [`ClusterClient`] over the Kubernetes API of one context
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn destinations(&self, namespace: &str) -> Api<ReplicationDestination> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_or_get(
        &self,
        key: &ObjectKey,
        spec: &DestinationSpec,
    ) -> Result<(RemoteHandle, bool)> {
        let api = self.destinations(&key.namespace);

        let existing = api
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error("get", key, e))?;

        let (rd, created) = match existing {
            Some(rd) => (rd, false),
            None => match api.create(&PostParams::default(), &build_destination(key, spec)).await {
                Ok(rd) => (rd, true),
                // Lost a create race: treat as pre-existing
                Err(e) if has_code(&e, 409) => {
                    let rd = api.get(&key.name).await.map_err(|e| api_error("get", key, e))?;
                    (rd, false)
                }
                Err(e) => return Err(api_error("create", key, e)),
            },
        };

        let handle = RemoteHandle {
            key: key.clone(),
            created,
            status: status_of(&rd),
        };
        Ok((handle, created))
    }

    async fn get_status(&self, handle: &RemoteHandle) -> Result<RemoteStatus> {
        let key = &handle.key;
        match self.destinations(&key.namespace).get_opt(&key.name).await {
            Ok(Some(rd)) => Ok(status_of(&rd)),
            Ok(None) => Err(Error::not_found("ReplicationDestination", key.to_string())),
            Err(e) => Err(api_error("get", key, e)),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        match self
            .destinations(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if has_code(&e, 404) => Ok(false),
            Err(e) => Err(api_error("delete", key, e)),
        }
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<BTreeMap<String, Vec<u8>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        let secret = api
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error("get secret", key, e))?
            .ok_or_else(|| Error::not_found("secret", key.to_string()))?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }

    async fn ensure_volume(&self, claim: &VolumeClaim) -> Result<bool> {
        let key = &claim.key;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);

        if api
            .get_opt(&key.name)
            .await
            .map_err(|e| api_error("get volume", key, e))?
            .is_some()
        {
            debug!("Volume {} already exists", key);
            return Ok(false);
        }

        match api.create(&PostParams::default(), &build_claim(claim)?).await {
            Ok(_) => Ok(true),
            Err(e) if has_code(&e, 409) => Ok(false),
            Err(e) => Err(api_error("create volume", key, e)),
        }
    }
}

/// Connects to clusters through the local kubeconfig
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, context: &str) -> Result<Arc<dyn ClusterClient>> {
        let config = if context.is_empty() {
            kube::Config::infer()
                .await
                .map_err(|e| Error::RemoteApi(format!("no usable kube config: {}", e)))?
        } else {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            };
            kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| Error::RemoteApi(format!("kube context {}: {}", context, e)))?
        };

        let client = Client::try_from(config)
            .map_err(|e| Error::RemoteApi(format!("kube client: {}", e)))?;
        debug!("Connected to cluster context {:?}", context);
        Ok(Arc::new(KubeCluster::new(client)))
    }
}
