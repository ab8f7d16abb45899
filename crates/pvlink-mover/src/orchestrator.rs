//! Relationship workflows
//!
//! Each operation is one sequential pass: load or create the relationship,
//! pick the transport handler recorded in it, then ensure the destination,
//! wait for it, optionally transfer, and save what was observed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use pvlink_core::{
    remote_object_name, validate_dns_label, AccessMode, Config, CopyMethod, Destination, Error, MoverSecurityContext,
    Relationship, RelationshipStore, RelationshipType, Result, ServiceType, Source,
    TransportKind,
};

use crate::cluster::{ClusterClient, ClusterConnector, RemoteHandle};
use crate::transport::{handler_for, RunContext, TransportHandler};

/// Parameters for attaching a destination to a new migration
#[derive(Clone, Debug)]
pub struct MigrationRequest {
    /// Kube context of the destination cluster (empty = default)
    pub cluster: String,
    pub namespace: String,
    pub pvc_name: String,
    pub transport: TransportKind,
    pub copy_method: Option<CopyMethod>,
    pub capacity: Option<String>,
    pub access_modes: Vec<AccessMode>,
    pub storage_class_name: Option<String>,
    pub service_type: Option<ServiceType>,
    pub mover_security_context: Option<MoverSecurityContext>,
}

impl MigrationRequest {
    pub fn new(namespace: impl Into<String>, pvc_name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            cluster: String::new(),
            namespace: namespace.into(),
            pvc_name: pvc_name.into(),
            transport,
            copy_method: None,
            capacity: None,
            access_modes: Vec::new(),
            storage_class_name: None,
            service_type: None,
            mover_security_context: None,
        }
    }

    /// Reject namespace and claim names the cluster would refuse
    pub fn validate(&self) -> Result<()> {
        validate_dns_label("namespace", &self.namespace)?;
        validate_dns_label("volume claim name", &self.pvc_name)
    }

    fn destination(&self, relationship: &str) -> Destination {
        Destination {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            rd_name: remote_object_name(&self.pvc_name, relationship),
            pvc_name: self.pvc_name.clone(),
            copy_method: Some(self.copy_method.unwrap_or_default()),
            capacity: self.capacity.clone(),
            access_modes: self.access_modes.clone(),
            storage_class_name: self.storage_class_name.clone(),
            service_type: self.service_type,
            mover_security_context: self.mover_security_context.clone(),
            ..Default::default()
        }
    }
}

/// Drives relationship workflows against one store
pub struct Orchestrator {
    ctx: RunContext,
    store: RelationshipStore,
    connector: Arc<dyn ClusterConnector>,
    clients: Mutex<HashMap<String, Arc<dyn ClusterClient>>>,
    ready_timeout: Duration,
}

impl Orchestrator {
    pub fn new(config: Config, connector: Arc<dyn ClusterConnector>) -> Self {
        let store = RelationshipStore::new(config.relationship_dir());
        let ready_timeout = config.cluster.ready_timeout();
        Self {
            ctx: RunContext::new(config),
            store,
            connector,
            clients: Mutex::new(HashMap::new()),
            ready_timeout,
        }
    }

    /// Override the readiness deadline from the config
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn store(&self) -> &RelationshipStore {
        &self.store
    }

    /// Client for a kube context, connected on first use
    async fn client(&self, context: &str) -> Result<Arc<dyn ClusterClient>> {
        if let Some(client) = self.clients.lock().get(context) {
            return Ok(client.clone());
        }

        let client = self.connector.connect(context).await?;
        self.clients
            .lock()
            .insert(context.to_string(), client.clone());
        Ok(client)
    }

    /// Create a migration and block until its destination is ready
    ///
    /// Fails with `AlreadyExists` when the record or the remote object is
    /// already there. The record is saved as soon as the remote object
    /// exists so a later `delete` can find it.
    pub async fn create_migration(
        &self,
        name: &str,
        request: &MigrationRequest,
    ) -> Result<Relationship> {
        request.validate()?;
        let mut rel = self.store.create(name, RelationshipType::Migration)?;
        let mut dest = request.destination(name);
        let handler = handler_for(request.transport);
        let client = self.client(&dest.cluster).await?;

        let handle = handler
            .ensure_destination(&self.ctx, client.as_ref(), &dest)
            .await?;
        if !handle.created {
            return Err(Error::already_exists("remote destination", handle.key.to_string()));
        }

        rel.data_mut().transport = Some(request.transport);
        rel.data_mut().destination = Some(dest.clone());
        rel.save()?;

        let handle = handler
            .wait_for_ready(&self.ctx, client.as_ref(), handle, self.ready_timeout)
            .await?;
        handler.record_ready(&mut dest, &handle);
        rel.data_mut().destination = Some(dest);
        rel.save()?;

        info!("Migration {} is ready", name);
        Ok(rel)
    }

    /// Copy `source` into the migration's destination
    pub async fn run_migration(&self, name: &str, source: &Path) -> Result<Relationship> {
        let mut rel = self.store.load(name, RelationshipType::Migration)?;
        let kind = rel.transport().ok_or_else(|| {
            Error::Config(format!("relationship {} has no transport", name))
        })?;
        let mut dest = rel.data().destination.clone().ok_or_else(|| {
            Error::Config(format!("relationship {} has no destination", name))
        })?;
        let handler = handler_for(kind);
        let client = self.client(&dest.cluster).await?;

        let handle = self.ready_destination(handler.as_ref(), client.as_ref(), &mut dest).await?;
        handler.record_ready(&mut dest, &handle);

        let data = rel.data_mut();
        data.destination = Some(dest.clone());
        data.source = Some(Source {
            path: Some(absolute(source)),
            ..data.source.clone().unwrap_or_default()
        });
        rel.save()?;

        handler
            .run_transfer(&self.ctx, client.as_ref(), source, &dest)
            .await?;

        info!("Migration {} transfer complete", name);
        Ok(rel)
    }

    async fn ready_destination(
        &self,
        handler: &dyn TransportHandler,
        client: &dyn ClusterClient,
        dest: &mut Destination,
    ) -> Result<RemoteHandle> {
        let handle = handler.ensure_destination(&self.ctx, client, dest).await?;
        if handle.created {
            // Recreated remotely; previously recorded status is stale
            warn!("Destination {} was missing and has been recreated", handle.key);
            dest.clear_status();
        }
        handler
            .wait_for_ready(&self.ctx, client, handle, self.ready_timeout)
            .await
    }

    /// Tear down the remote object (best effort) and remove the record
    pub async fn delete_migration(&self, name: &str) -> Result<()> {
        let rel = self.store.load(name, RelationshipType::Migration)?;

        if let Some(dest) = rel.data().destination.as_ref() {
            let key = dest.object_key();
            match self.client(&dest.cluster).await {
                Ok(client) => match client.delete(&key).await {
                    Ok(true) => info!("Deleted remote destination {}", key),
                    Ok(false) => info!("Remote destination {} was already gone", key),
                    Err(e) => warn!("Failed to delete remote destination {}: {}", key, e),
                },
                Err(e) => warn!("Failed to reach cluster for {}: {}", key, e),
            }
        }

        rel.delete()
    }

    /// Record of a migration as stored on disk
    pub fn show_migration(&self, name: &str) -> Result<String> {
        self.store.load(name, RelationshipType::Migration)?.to_toml()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.store.list()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
