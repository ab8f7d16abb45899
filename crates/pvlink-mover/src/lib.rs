//! pvlink mover - cluster client, secure transports and transfer engine
//!
//! This crate provides:
//! - A cluster client seam with a Kubernetes implementation
//! - Credential staging into scoped, owner-only temporary directories
//! - Two transports: rsync over ssh, and rsync through a PSK-TLS tunnel
//! - The orchestrator driving relationship workflows
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                           │
//! │  load/create relationship -> pick TransportHandler          │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ ensure -> wait -> transfer
//!                               ▼
//! ┌──────────────────────────┐     ┌────────────────────────────┐
//! │  ClusterClient (kube)    │     │  TransferEngine (rsync)    │
//! │  remote object + secrets │     │  Tunnel (stunnel child)    │
//! └──────────────────────────┘     └────────────────────────────┘
//! ```
//!
//! Every run owns one cancellation token. The readiness poll loop and the
//! tunnel supervisor both observe it; the copy subprocess is only checked
//! between passes.

pub mod cluster;
pub mod credentials;
pub mod engine;
pub mod kubernetes;
pub mod orchestrator;
pub mod readiness;
pub mod transport;
pub mod tunnel;

pub use cluster::{
    ClusterClient, ClusterConnector, DestinationSpec, RemoteHandle, RemoteStatus, VolumeClaim,
};
pub use credentials::{PskMaterial, SecureChannelBroker, SshMaterial, StagingDir};
pub use engine::{Invocation, TransferEngine};
pub use kubernetes::{KubeCluster, KubeConnector, ReplicationDestination};
pub use orchestrator::{MigrationRequest, Orchestrator};
pub use readiness::{wait_until_ready, PollPolicy, Readiness, ReadinessTracker};
pub use transport::{handler_for, RunContext, SshTransport, TlsTunnelTransport, TransportHandler};
pub use tunnel::Tunnel;
