//! Transport handlers
//!
//! A relationship uses exactly one secure channel for its lifetime. The
//! handler for it is picked once from the recorded [`TransportKind`] with
//! [`handler_for`] and then drives every step:
//!
//! 1. `ensure_destination` - idempotently create the remote object
//! 2. `wait_for_ready` - poll until address and secret reference appear
//! 3. `run_transfer` - stage credentials and run the copy

mod ssh;
mod tls;

pub use ssh::SshTransport;
pub use tls::TlsTunnelTransport;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pvlink_core::{Config, Destination, Error, ObjectKey, Result, TransportKind};

use crate::cluster::{ClusterClient, DestinationSpec, RemoteHandle, VolumeClaim};
use crate::credentials::StagingDir;
use crate::engine::TransferEngine;
use crate::readiness::{wait_until_ready, PollPolicy};

/// Explicit per-invocation state threaded through every call
#[derive(Clone, Debug)]
pub struct RunContext {
    pub config: Arc<Config>,
    /// Cancelling this aborts polling and stops the tunnel
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn poll_policy(&self, timeout: Duration) -> PollPolicy {
        PollPolicy {
            interval: self.config.cluster.poll_interval(),
            timeout,
        }
    }

    pub fn engine(&self) -> TransferEngine {
        TransferEngine::new(self.config.rsync.clone())
    }

    /// Fresh exclusive staging directory for one run
    pub fn staging_dir(&self) -> Result<StagingDir> {
        StagingDir::new(self.config.staging.work_dir.as_deref())
    }
}

/// Protocol-specific steps of a transfer
#[async_trait]
pub trait TransportHandler: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Remote object spec for this transport
    fn destination_spec(&self, dest: &Destination) -> DestinationSpec;

    /// Create the remote destination object unless it already exists
    ///
    /// The destination volume is made sure of first.
    async fn ensure_destination(
        &self,
        _ctx: &RunContext,
        client: &dyn ClusterClient,
        dest: &Destination,
    ) -> Result<RemoteHandle> {
        if !dest.pvc_name.is_empty() {
            let claim = VolumeClaim {
                key: ObjectKey::new(&dest.namespace, &dest.pvc_name),
                capacity: dest.capacity.clone(),
                access_modes: dest.access_modes.clone(),
                storage_class_name: dest.storage_class_name.clone(),
            };
            if client.ensure_volume(&claim).await? {
                info!("Created destination volume {}", claim.key);
            }
        }

        let key = dest.object_key();
        let (handle, created) = client
            .create_or_get(&key, &self.destination_spec(dest))
            .await?;
        if created {
            info!("Created {} destination {}", self.kind(), key);
        } else {
            debug!("Destination {} already exists", key);
        }
        Ok(handle)
    }

    /// Poll until the remote object is ready for this transport
    async fn wait_for_ready(
        &self,
        ctx: &RunContext,
        client: &dyn ClusterClient,
        handle: RemoteHandle,
        timeout: Duration,
    ) -> Result<RemoteHandle> {
        wait_until_ready(client, handle, self.kind(), &ctx.poll_policy(timeout), &ctx.cancel).await
    }

    /// Copy the address and secret reference of a ready object into `dest`
    fn record_ready(&self, dest: &mut Destination, handle: &RemoteHandle) {
        dest.address = handle.status.address.clone();
        let secret = handle.status.secret_for(self.kind()).map(str::to_string);
        match self.kind() {
            TransportKind::Ssh => dest.ssh_key_secret_name = secret,
            TransportKind::PskTls => dest.psk_secret_name = secret,
        }
    }

    /// Stage credentials and copy `source` to the destination
    async fn run_transfer(
        &self,
        ctx: &RunContext,
        client: &dyn ClusterClient,
        source: &Path,
        dest: &Destination,
    ) -> Result<()>;
}

/// Handler for a transport kind
pub fn handler_for(kind: TransportKind) -> Box<dyn TransportHandler> {
    match kind {
        TransportKind::Ssh => Box::new(SshTransport),
        TransportKind::PskTls => Box::new(TlsTunnelTransport),
    }
}

/// Address and secret reference of a ready destination
fn ready_endpoint(dest: &Destination, kind: TransportKind) -> Result<(&str, ObjectKey)> {
    let address = dest.address.as_deref().ok_or_else(|| {
        Error::Config(format!("destination {} has no address yet", dest.object_key()))
    })?;
    let secret = dest.secret_name(kind).ok_or_else(|| {
        Error::Config(format!(
            "destination {} has no {} secret yet",
            dest.object_key(),
            kind
        ))
    })?;
    Ok((address, ObjectKey::new(&dest.namespace, secret)))
}

fn check_source(source: &Path) -> Result<()> {
    if source.is_dir() {
        Ok(())
    } else {
        Err(Error::Config(format!("source {:?} is not a directory", source)))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cluster::fake::{FakeCluster, Publish};
    use pvlink_core::MoverSecurityContext;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_destination_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), vec!["rsync".into()], vec!["stunnel".into()]);
        let cluster = FakeCluster::new(Publish::default());
        cluster.add_volume("ns", "data");
        let handler = handler_for(TransportKind::Ssh);
        let dest = ready_destination(TransportKind::Ssh);

        let first = handler.ensure_destination(&ctx, &cluster, &dest).await.unwrap();
        let second = handler.ensure_destination(&ctx, &cluster, &dest).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.key, second.key);
        assert_eq!(cluster.object_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_destination_creates_volume() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), vec!["rsync".into()], vec!["stunnel".into()]);
        let cluster = FakeCluster::new(Publish::default());
        let mut dest = ready_destination(TransportKind::Ssh);

        // Missing volume without a capacity hint
        let handler = handler_for(TransportKind::Ssh);
        assert!(handler.ensure_destination(&ctx, &cluster, &dest).await.is_err());
        assert_eq!(cluster.object_count(), 0);

        dest.capacity = Some("1Gi".into());
        handler.ensure_destination(&ctx, &cluster, &dest).await.unwrap();
        assert!(cluster.has_volume(&ObjectKey::new("ns", "data")));
    }

    #[test]
    fn test_security_context_only_for_tls() {
        let mut dest = ready_destination(TransportKind::PskTls);
        dest.mover_security_context = Some(MoverSecurityContext {
            run_as_user: Some(1000),
            ..Default::default()
        });

        let tls = handler_for(TransportKind::PskTls).destination_spec(&dest);
        let ssh = handler_for(TransportKind::Ssh).destination_spec(&dest);
        assert!(tls.mover_security_context.is_some());
        assert!(ssh.mover_security_context.is_none());
        assert_eq!(tls.destination_pvc.as_deref(), Some("data"));
    }

    #[test]
    fn test_record_ready() {
        let handle = RemoteHandle {
            key: ObjectKey::new("ns", "rd"),
            created: false,
            status: crate::cluster::RemoteStatus {
                address: Some("1.1.1.1".into()),
                ssh_keys: None,
                key_secret: Some("psk".into()),
            },
        };
        let mut dest = Destination::default();
        handler_for(TransportKind::PskTls).record_ready(&mut dest, &handle);
        assert_eq!(dest.address.as_deref(), Some("1.1.1.1"));
        assert_eq!(dest.psk_secret_name.as_deref(), Some("psk"));
        assert!(dest.ssh_key_secret_name.is_none());
    }

    #[test]
    fn test_ready_endpoint_requires_status() {
        let mut dest = ready_destination(TransportKind::Ssh);
        dest.address = None;
        assert!(ready_endpoint(&dest, TransportKind::Ssh).unwrap_err().is_config());

        let dest = ready_destination(TransportKind::Ssh);
        assert!(ready_endpoint(&dest, TransportKind::PskTls).is_err());
        let (address, secret) = ready_endpoint(&dest, TransportKind::Ssh).unwrap();
        assert_eq!(address, "10.0.0.7");
        assert_eq!(secret, ObjectKey::new("ns", "mover-secret"));
    }
}
