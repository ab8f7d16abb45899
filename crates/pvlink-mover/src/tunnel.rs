//! Local PSK-TLS tunnel
//!
//! The tunnel runs stunnel in the foreground as a child process. It
//! terminates the pre-shared-key TLS connection to the remote mover and
//! exposes a plaintext rsync daemon endpoint on loopback.
//!
//! Lifetime: a supervisor task owns the child and waits for either its exit
//! or cancellation of a token derived from the run's token. The [`Tunnel`]
//! handle holds that token behind a drop guard, so dropping the handle (for
//! example when a caller times out the surrounding future) stops the child.
//! Readiness is the appearance of the pid file stunnel writes once it is
//! listening.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use pvlink_core::{Error, Result, TunnelConfig};

use crate::credentials::{PskMaterial, StagingDir};

const CONFIG_FILE: &str = "stunnel.conf";
const PID_FILE: &str = "stunnel.pid";

/// Loopback address the tunnel accepts on
pub const LOOPBACK: &str = "127.0.0.1";

/// Render the client configuration
pub fn render_config(
    pid_file: &Path,
    psk_file: &Path,
    local_port: u16,
    remote_address: &str,
    remote_port: u16,
) -> String {
    format!(
        r#"; pvlink tunnel client
debug = debug
foreground = yes
pid = {pid}
socket = l:SO_KEEPALIVE=1
socket = l:TCP_KEEPIDLE=180
socket = r:SO_KEEPALIVE=1
socket = r:TCP_KEEPIDLE=180
syslog = no

[rsync]
ciphers = PSK
PSKsecrets = {psk}
accept = {loopback}:{local_port}
client = yes
connect = {remote_address}:{remote_port}
"#,
        pid = pid_file.display(),
        psk = psk_file.display(),
        loopback = LOOPBACK,
        local_port = local_port,
        remote_address = remote_address,
        remote_port = remote_port,
    )
}

/// A running tunnel subprocess
#[derive(Debug)]
pub struct Tunnel {
    /// Cancels the supervisor's token when the handle goes away
    stop: DropGuard,
    supervisor: JoinHandle<Option<ExitStatus>>,
    pid: Option<u32>,
    pid_file: PathBuf,
}

impl Tunnel {
    /// Start the tunnel and wait until it has written its pid file
    ///
    /// On failure the child has already been stopped and reaped.
    pub async fn start(
        config: &TunnelConfig,
        staging: &StagingDir,
        psk: &PskMaterial,
        remote_address: &str,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let pid_file = staging.path().join(PID_FILE);
        let rendered = render_config(
            &pid_file,
            &psk.psk_file,
            config.local_port,
            remote_address,
            config.remote_port,
        );
        let config_file = staging.write_private(CONFIG_FILE, rendered.as_bytes())?;

        let mut parts = config.command.iter();
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("tunnel.command must not be empty".into()))?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(&config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TunnelStartup(format!("failed to start {}: {}", program, e)))?;

        let pid = child.id();
        let cancel = parent.child_token();
        let token = cancel.clone();
        let supervisor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => status.ok(),
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop tunnel: {}", e);
                    }
                    None
                }
            }
        });

        info!(
            "Started tunnel (pid {:?}) {}:{} -> {}:{}",
            pid, LOOPBACK, config.local_port, remote_address, config.remote_port
        );

        let tunnel = Self {
            stop: cancel.drop_guard(),
            supervisor,
            pid,
            pid_file,
        };

        match tunnel.wait_ready(config, parent).await {
            Ok(()) => Ok(tunnel),
            Err(e) => {
                tunnel.shutdown().await;
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, config: &TunnelConfig, parent: &CancellationToken) -> Result<()> {
        for attempt in 1..=config.pid_poll_attempts {
            if self.pid_file.exists() {
                debug!("Tunnel pid file present after {} checks", attempt);
                return Ok(());
            }
            if self.supervisor.is_finished() {
                return Err(Error::TunnelStartup(
                    "tunnel exited before writing its pid file".into(),
                ));
            }
            tokio::select! {
                _ = parent.cancelled() => return Err(Error::Cancelled),
                _ = sleep(config.pid_poll_interval()) => {}
            }
        }

        if self.pid_file.exists() {
            return Ok(());
        }
        Err(Error::TunnelStartup(format!(
            "pid file {:?} did not appear after {} checks",
            self.pid_file, config.pid_poll_attempts
        )))
    }

    /// OS pid of the tunnel child
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// rsync daemon URL served through the tunnel
    pub fn rsync_url(config: &TunnelConfig) -> String {
        format!(
            "rsync://{}:{}/{}/",
            LOOPBACK, config.local_port, config.rsync_module
        )
    }

    /// Stop the child and wait for it; the induced exit status is ignored
    pub async fn shutdown(self) {
        self.stop.disarm().cancel();
        match self.supervisor.await {
            Ok(Some(status)) => debug!("Tunnel had already exited: {}", status),
            Ok(None) => debug!("Tunnel stopped"),
            Err(e) => warn!("Tunnel supervisor failed: {}", e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    fn fast_config(command: Vec<String>) -> TunnelConfig {
        TunnelConfig {
            command,
            pid_poll_interval_ms: 20,
            pid_poll_attempts: 50,
            ..Default::default()
        }
    }

    fn staged_psk(staging: &StagingDir) -> PskMaterial {
        PskMaterial {
            psk_file: staging.write_private("psk.txt", b"volsync:abcd").unwrap(),
        }
    }

    #[test]
    fn test_render_config() {
        let conf = render_config(
            Path::new("/run/t.pid"),
            Path::new("/run/psk.txt"),
            9000,
            "10.0.0.7",
            8000,
        );
        assert!(conf.contains("foreground = yes"));
        assert!(conf.contains("pid = /run/t.pid"));
        assert!(conf.contains("ciphers = PSK"));
        assert!(conf.contains("PSKsecrets = /run/psk.txt"));
        assert!(conf.contains("accept = 127.0.0.1:9000"));
        assert!(conf.contains("connect = 10.0.0.7:8000"));
        assert!(conf.contains("client = yes"));
    }

    #[test]
    fn test_rsync_url() {
        assert_eq!(
            Tunnel::rsync_url(&TunnelConfig::default()),
            "rsync://127.0.0.1:9000/data/"
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::new(None).unwrap();
        let config = fast_config(fake_tunnel(tmp.path(), true));

        let tunnel = Tunnel::start(
            &config,
            &staging,
            &staged_psk(&staging),
            "10.0.0.7",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let pid = tunnel.pid().unwrap();
        assert!(staging.path().join(PID_FILE).exists());

        tunnel.shutdown().await;
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_missing_pid_file_is_startup_error() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::new(None).unwrap();
        let mut config = fast_config(fake_tunnel(tmp.path(), false));
        config.pid_poll_attempts = 5;

        let err = Tunnel::start(
            &config,
            &staging,
            &staged_psk(&staging),
            "10.0.0.7",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TunnelStartup(_)));

        if let Some(pid) = started_pid(tmp.path()) {
            assert!(!is_alive(pid));
        }
    }

    #[tokio::test]
    async fn test_early_exit_is_startup_error() {
        let staging = StagingDir::new(None).unwrap();
        let config = fast_config(vec!["/bin/sh".into(), "-c".into(), "exit 3".into()]);

        let err = Tunnel::start(
            &config,
            &staging,
            &staged_psk(&staging),
            "10.0.0.7",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TunnelStartup(_)));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_tunnel() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::new(None).unwrap();
        let config = fast_config(fake_tunnel(tmp.path(), true));
        let parent = CancellationToken::new();

        let tunnel = Tunnel::start(&config, &staging, &staged_psk(&staging), "10.0.0.7", &parent)
            .await
            .unwrap();
        parent.cancel();
        let pid = tunnel.pid();
        tunnel.shutdown().await;

        assert!(!is_alive(pid.unwrap()));
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_tunnel() {
        let tmp = TempDir::new().unwrap();
        let staging = StagingDir::new(None).unwrap();
        let config = fast_config(fake_tunnel(tmp.path(), true));

        let tunnel = Tunnel::start(
            &config,
            &staging,
            &staged_psk(&staging),
            "10.0.0.7",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let pid = tunnel.pid().unwrap();
        drop(tunnel);

        // The supervisor reaps the child on the runtime after the drop
        for _ in 0..100 {
            if !is_alive(pid) {
                break;
            }
            sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!is_alive(pid));
    }
}
