//! rsync over ssh

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use pvlink_core::{Destination, ObjectKey, Result, TransportKind};

use super::{check_source, ready_endpoint, RunContext, TransportHandler};
use crate::cluster::{ClusterClient, DestinationSpec};
use crate::credentials::{SecureChannelBroker, StagingDir};

/// Single rsync invocation over ssh, destination host key pinned
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransport;

impl SshTransport {
    async fn transfer(
        &self,
        ctx: &RunContext,
        client: &dyn ClusterClient,
        staging: &StagingDir,
        source: &Path,
        address: &str,
        secret: &ObjectKey,
    ) -> Result<()> {
        let material = SecureChannelBroker::new(client)
            .stage_ssh(staging, secret, address, ctx.config.rsync.ssh_port)
            .await?;

        let engine = ctx.engine();
        engine.run(&engine.ssh_copy(source, &material, address)).await
    }
}

#[async_trait]
impl TransportHandler for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn destination_spec(&self, dest: &Destination) -> DestinationSpec {
        DestinationSpec {
            transport: TransportKind::Ssh,
            copy_method: dest.copy_method(),
            destination_pvc: Some(dest.pvc_name.clone()).filter(|p| !p.is_empty()),
            capacity: dest.capacity.clone(),
            access_modes: dest.access_modes.clone(),
            storage_class_name: dest.storage_class_name.clone(),
            service_type: dest.service_type,
            mover_security_context: None,
        }
    }

    async fn run_transfer(
        &self,
        ctx: &RunContext,
        client: &dyn ClusterClient,
        source: &Path,
        dest: &Destination,
    ) -> Result<()> {
        check_source(source)?;
        let (address, secret) = ready_endpoint(dest, TransportKind::Ssh)?;

        info!("Copying {:?} to {} over ssh", source, address);
        let staging = ctx.staging_dir()?;
        let result = self
            .transfer(ctx, client, &staging, source, address, &secret)
            .await;
        staging.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{FakeCluster, Publish};
    use crate::credentials::{SSH_DESTINATION_KEY, SSH_PRIVATE_KEY, SSH_PUBLIC_KEY};
    use crate::engine::testing::{fake_rsync, logged_calls};
    use crate::transport::testing::{context, is_empty_dir, ready_destination};
    use pvlink_core::Error;
    use tempfile::TempDir;

    fn cluster_with_keys() -> FakeCluster {
        let cluster = FakeCluster::new(Publish::default());
        cluster.add_secret(
            "ns",
            "mover-secret",
            &[
                (SSH_PRIVATE_KEY, b"PRIVATE".as_slice()),
                (SSH_PUBLIC_KEY, b"ssh-ed25519 AAAA".as_slice()),
                (SSH_DESTINATION_KEY, b"ssh-ed25519 BBBB".as_slice()),
            ],
        );
        cluster
    }

    #[tokio::test]
    async fn test_ssh_transfer_success_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let (rsync, log) = fake_rsync(tmp.path(), 0);
        let ctx = context(work.path(), rsync, vec!["stunnel".into()]);

        SshTransport
            .run_transfer(
                &ctx,
                &cluster_with_keys(),
                src.path(),
                &ready_destination(TransportKind::Ssh),
            )
            .await
            .unwrap();

        let calls = logged_calls(&log);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("--delete"));
        assert!(calls[0].ends_with("root@10.0.0.7:."));
        assert!(is_empty_dir(work.path()));
    }

    #[tokio::test]
    async fn test_ssh_transfer_failure_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let (rsync, _) = fake_rsync(tmp.path(), 12);
        let ctx = context(work.path(), rsync, vec!["stunnel".into()]);

        let err = SshTransport
            .run_transfer(
                &ctx,
                &cluster_with_keys(),
                src.path(),
                &ready_destination(TransportKind::Ssh),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert!(is_empty_dir(work.path()));
    }

    #[tokio::test]
    async fn test_ssh_missing_secret_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let (rsync, log) = fake_rsync(tmp.path(), 0);
        let ctx = context(work.path(), rsync, vec!["stunnel".into()]);

        let err = SshTransport
            .run_transfer(
                &ctx,
                &FakeCluster::new(Publish::default()),
                src.path(),
                &ready_destination(TransportKind::Ssh),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Staging(_)));
        assert!(logged_calls(&log).is_empty());
        assert!(is_empty_dir(work.path()));
    }
}
