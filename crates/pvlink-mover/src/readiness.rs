//! Readiness polling for remote destination objects
//!
//! The remote reconciler converges asynchronously; we observe it through a
//! bounded poll loop. The observed state only moves forward:
//!
//! ```text
//! Unset ──► AddressOnly ──► Ready (address + secret reference)
//! ```

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pvlink_core::{Error, Result, TransportKind};

use crate::cluster::{ClusterClient, RemoteHandle, RemoteStatus};

/// Observed readiness of a remote object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Readiness {
    Unset,
    AddressOnly,
    Ready,
}

impl Readiness {
    /// Classify a status snapshot for a transport
    ///
    /// A secret reference without an address still counts as `Unset`.
    pub fn of(status: &RemoteStatus, kind: TransportKind) -> Self {
        match (status.address.is_some(), status.secret_for(kind).is_some()) {
            (true, true) => Readiness::Ready,
            (true, false) => Readiness::AddressOnly,
            (false, _) => Readiness::Unset,
        }
    }
}

/// Monotonic readiness tracker
#[derive(Debug)]
pub struct ReadinessTracker {
    kind: TransportKind,
    state: Readiness,
}

impl ReadinessTracker {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Readiness::Unset,
        }
    }

    pub fn state(&self) -> Readiness {
        self.state
    }

    /// Feed a new snapshot; returns the (possibly unchanged) state
    pub fn observe(&mut self, status: &RemoteStatus) -> Readiness {
        let seen = Readiness::of(status, self.kind);
        if seen < self.state {
            warn!(
                "Remote status went from {:?} back to {:?}, still waiting",
                self.state, seen
            );
        } else if seen != self.state {
            debug!("Remote readiness {:?} -> {:?}", self.state, seen);
            self.state = seen;
        }
        self.state
    }
}

/// Poll settings
#[derive(Clone, Debug)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Poll `client` until the object reports an address and the transport's
/// secret reference, the timeout elapses, or `cancel` fires
///
/// Success requires both fields in the same snapshot.
pub async fn wait_until_ready(
    client: &dyn ClusterClient,
    mut handle: RemoteHandle,
    kind: TransportKind,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<RemoteHandle> {
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut tracker = ReadinessTracker::new(kind);

    info!("Waiting for {} to become ready", handle.key);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let status = client.get_status(&handle).await?;
        let now_ready = Readiness::of(&status, kind) == Readiness::Ready;
        tracker.observe(&status);
        handle.status = status;

        if now_ready {
            info!("{} is ready ({})", handle.key, handle.status);
            return Ok(handle);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                object: handle.key.to_string(),
                elapsed: now - start,
                last_status: handle.status.to_string(),
            });
        }

        let nap = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{FakeCluster, Publish};
    use crate::cluster::DestinationSpec;
    use pvlink_core::{CopyMethod, ObjectKey};

    fn policy(timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn created(cluster: &FakeCluster, kind: TransportKind) -> RemoteHandle {
        let spec = DestinationSpec {
            transport: kind,
            copy_method: CopyMethod::Direct,
            destination_pvc: None,
            capacity: None,
            access_modes: Vec::new(),
            storage_class_name: None,
            service_type: None,
            mover_security_context: None,
        };
        cluster
            .create_or_get(&ObjectKey::new("ns", "rd"), &spec)
            .await
            .unwrap()
            .0
    }

    #[test]
    fn test_readiness_classification() {
        let mut status = RemoteStatus::default();
        assert_eq!(Readiness::of(&status, TransportKind::Ssh), Readiness::Unset);

        status.ssh_keys = Some("keys".into());
        assert_eq!(Readiness::of(&status, TransportKind::Ssh), Readiness::Unset);

        status.address = Some("10.0.0.1".into());
        assert_eq!(Readiness::of(&status, TransportKind::Ssh), Readiness::Ready);
        // The TLS transport needs its own secret reference
        assert_eq!(
            Readiness::of(&status, TransportKind::PskTls),
            Readiness::AddressOnly
        );
    }

    #[test]
    fn test_tracker_never_regresses() {
        let mut tracker = ReadinessTracker::new(TransportKind::PskTls);
        let addressed = RemoteStatus {
            address: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(tracker.observe(&addressed), Readiness::AddressOnly);
        assert_eq!(tracker.observe(&RemoteStatus::default()), Readiness::AddressOnly);
    }

    #[tokio::test]
    async fn test_wait_reaches_ready() {
        let cluster = FakeCluster::new(Publish::ready_after(3));
        let handle = created(&cluster, TransportKind::PskTls).await;

        let ready = wait_until_ready(
            &cluster,
            handle,
            TransportKind::PskTls,
            &policy(2_000),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ready.status.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(ready.status.key_secret.as_deref(), Some("mover-secret"));
    }

    #[tokio::test]
    async fn test_address_only_keeps_polling_until_timeout() {
        let publish = Publish {
            address_after: Some(0),
            secret_after: None,
            address: "10.0.0.7".into(),
            secret: String::new(),
        };
        let cluster = FakeCluster::new(publish);
        let handle = created(&cluster, TransportKind::Ssh).await;

        let err = wait_until_ready(
            &cluster,
            handle,
            TransportKind::Ssh,
            &policy(60),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            Error::Timeout { last_status, .. } => {
                assert!(last_status.contains("address=10.0.0.7"));
                assert!(last_status.contains("sshKeys=<unset>"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let cluster = FakeCluster::new(Publish::default());
        let handle = created(&cluster, TransportKind::Ssh).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_until_ready(&cluster, handle, TransportKind::Ssh, &policy(1_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
