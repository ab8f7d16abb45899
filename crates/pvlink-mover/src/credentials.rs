//! Credential staging
//!
//! Secrets published by the remote reconciler are copied into a per-run
//! temporary directory with owner-only permissions. The directory is removed
//! when the [`StagingDir`] is closed or dropped, whichever comes first.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use pvlink_core::{Error, ObjectKey, Result};

use crate::cluster::ClusterClient;

/// Secret key holding the source private key
pub const SSH_PRIVATE_KEY: &str = "source";
/// Secret key holding the source public key
pub const SSH_PUBLIC_KEY: &str = "source.pub";
/// Secret key holding the destination host key
pub const SSH_DESTINATION_KEY: &str = "destination.pub";
/// Secret key holding the pre-shared key
pub const PSK_KEY: &str = "psk.txt";

const STAGING_PREFIX: &str = "pvlink-";

const DEFAULT_SSH_PORT: u16 = 22;

/// Exclusive temporary directory for one run
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    /// Create a fresh directory under `root` (system temp dir if None)
    pub fn new(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!("Staging directory {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the directory, readable by the owner only
    pub fn write_private(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .map_err(|e| Error::Staging(format!("creating {:?}: {}", path, e)))?;
        file.write_all(contents)
            .map_err(|e| Error::Staging(format!("writing {:?}: {}", path, e)))?;
        file.sync_all()?;
        Ok(path)
    }

    /// Remove the directory, reporting failure instead of swallowing it
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| Error::Cleanup(format!("removing {:?}: {}", path, e)))
    }

    /// Remove the directory; failures are logged only
    pub fn release(self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

/// SSH key files staged for one run
#[derive(Debug, Clone)]
pub struct SshMaterial {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    /// known_hosts file pinning the destination address to its host key
    pub known_hosts: PathBuf,
}

/// Pre-shared key file staged for one run
#[derive(Debug, Clone)]
pub struct PskMaterial {
    pub psk_file: PathBuf,
}

/// Resolves secret references and stages their contents
pub struct SecureChannelBroker<'a> {
    client: &'a dyn ClusterClient,
}

impl<'a> SecureChannelBroker<'a> {
    pub fn new(client: &'a dyn ClusterClient) -> Self {
        Self { client }
    }

    async fn fetch(&self, secret: &ObjectKey) -> Result<BTreeMap<String, Vec<u8>>> {
        self.client
            .get_secret(secret)
            .await
            .map_err(|e| Error::Staging(format!("reading secret {}: {}", secret, e)))
    }

    /// Stage the SSH keypair and a known_hosts entry for `address:port`
    pub async fn stage_ssh(
        &self,
        staging: &StagingDir,
        secret: &ObjectKey,
        address: &str,
        port: u16,
    ) -> Result<SshMaterial> {
        let data = self.fetch(secret).await?;
        let private = entry(&data, secret, SSH_PRIVATE_KEY)?;
        let public = entry(&data, secret, SSH_PUBLIC_KEY)?;
        let host_key = entry(&data, secret, SSH_DESTINATION_KEY)?;

        let private_key = staging.write_private("source", private)?;
        let public_key = staging.write_private("source.pub", public)?;
        let known_hosts = staging.write_private(
            "known_hosts",
            known_hosts_line(address, port, host_key).as_bytes(),
        )?;

        debug!("Staged ssh material from secret {}", secret);
        Ok(SshMaterial {
            private_key,
            public_key,
            known_hosts,
        })
    }

    /// Stage the pre-shared key
    pub async fn stage_psk(&self, staging: &StagingDir, secret: &ObjectKey) -> Result<PskMaterial> {
        let data = self.fetch(secret).await?;
        let psk = entry(&data, secret, PSK_KEY)?;
        let psk_file = staging.write_private("psk.txt", psk)?;

        debug!("Staged pre-shared key from secret {}", secret);
        Ok(PskMaterial { psk_file })
    }
}

fn entry<'d>(
    data: &'d BTreeMap<String, Vec<u8>>,
    secret: &ObjectKey,
    key: &str,
) -> Result<&'d [u8]> {
    data.get(key)
        .map(Vec::as_slice)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Staging(format!("secret {} has no {:?} entry", secret, key)))
}

/// known_hosts line for the host key; ssh looks up non-default ports as
/// `[address]:port`
fn known_hosts_line(address: &str, port: u16, host_key: &[u8]) -> String {
    let host_key = String::from_utf8_lossy(host_key);
    if port == DEFAULT_SSH_PORT {
        format!("{} {}\n", address, host_key.trim())
    } else {
        format!("[{}]:{} {}\n", address, port, host_key.trim())
    }
}
