//! rsync through a local pre-shared-key TLS tunnel

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use pvlink_core::{Destination, ObjectKey, Result, TransportKind};

use super::{check_source, ready_endpoint, RunContext, TransportHandler};
use crate::cluster::{ClusterClient, DestinationSpec};
use crate::credentials::{SecureChannelBroker, StagingDir};
use crate::tunnel::Tunnel;

/// Two-pass rsync against the loopback end of an stunnel client
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsTunnelTransport;

impl TlsTunnelTransport {
    async fn transfer(
        &self,
        ctx: &RunContext,
        client: &dyn ClusterClient,
        staging: &StagingDir,
        source: &Path,
        address: &str,
        secret: &ObjectKey,
    ) -> Result<()> {
        let psk = SecureChannelBroker::new(client)
            .stage_psk(staging, secret)
            .await?;

        let tunnel = Tunnel::start(&ctx.config.tunnel, staging, &psk, address, &ctx.cancel).await?;

        let url = Tunnel::rsync_url(&ctx.config.tunnel);
        let result = ctx.engine().two_pass(source, &url, &ctx.cancel).await;

        tunnel.shutdown().await;
        result
    }
}

#[async_trait]
impl TransportHandler for TlsTunnelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PskTls
    }

    fn destination_spec(&self, dest: &Destination) -> DestinationSpec {
        DestinationSpec {
            transport: TransportKind::PskTls,
            copy_method: dest.copy_method(),
            destination_pvc: Some(dest.pvc_name.clone()).filter(|p| !p.is_empty()),
            capacity: dest.capacity.clone(),
            access_modes: dest.access_modes.clone(),
            storage_class_name: dest.storage_class_name.clone(),
            service_type: dest.service_type,
            mover_security_context: dest
                .mover_security_context
                .clone()
                .filter(|c| !c.is_empty()),
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
        let (address, secret) = ready_endpoint(dest, TransportKind::PskTls)?;

        info!("Copying {:?} to {} through the TLS tunnel", source, address);
        let staging = ctx.staging_dir()?;
        let result = self
            .transfer(ctx, client, &staging, source, address, &secret)
            .await;
        staging.release();
        result
    }
}
