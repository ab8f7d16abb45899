//! Bulk copy subprocess supervision
//!
//! Builds and runs rsync invocations. Two protocols are supported:
//!
//! - **ssh**: one invocation with delete semantics against `user@address:.`
//! - **two-pass** (over the local tunnel endpoint):
//!   1. preserve pass, each top-level source entry listed individually so the
//!      destination root keeps its own attributes, no deletes
//!   2. cleanup pass, directory level, `--ignore-existing
//!      --ignore-non-existing --delete` so only destination-only files go
//!
//! stdio is inherited so rsync's itemized output reaches the user live.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pvlink_core::{Error, Result, RsyncConfig};

use crate::credentials::SshMaterial;

const ARCHIVE_FLAGS: &str = "-aHSxzh";
const ACL_XATTR_FLAGS: &str = "-AX";
const REPORT_FLAGS: [&str; 2] = ["--itemize-changes", "--info=stats2,misc2"];

/// One fully-formed rsync command line
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    /// Human-readable name used in logs and errors
    pub label: &'static str,
    pub program: String,
    pub args: Vec<OsString>,
}

impl Invocation {
    fn new(label: &'static str, config: &RsyncConfig) -> Self {
        let mut parts = config.command.iter();
        let program = parts.next().cloned().unwrap_or_else(|| "rsync".into());
        Self {
            label,
            program,
            args: parts.map(OsString::from).collect(),
        }
    }

    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Whether any argument equals `flag`
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// Runs rsync according to the configured flags
#[derive(Clone, Debug)]
pub struct TransferEngine {
    config: RsyncConfig,
}

impl TransferEngine {
    pub fn new(config: RsyncConfig) -> Self {
        Self { config }
    }

    fn push_archive_flags(&self, inv: &mut Invocation) {
        inv.arg(ARCHIVE_FLAGS);
        if self.config.preserve_acls_xattrs {
            inv.arg(ACL_XATTR_FLAGS);
        }
    }

    fn push_excludes(&self, inv: &mut Invocation) {
        for name in &self.config.excludes {
            inv.arg(format!("--exclude={}", name));
        }
    }

    /// Single ssh-transported copy with delete semantics
    pub fn ssh_copy(&self, source: &Path, material: &SshMaterial, address: &str) -> Invocation {
        let mut inv = Invocation::new("ssh copy", &self.config);
        self.push_archive_flags(&mut inv);
        inv.arg("--delete");
        self.push_excludes(&mut inv);
        for flag in REPORT_FLAGS {
            inv.arg(flag);
        }

        let remote_shell = format!(
            "{} -i '{}' -o 'UserKnownHostsFile={}' -o StrictHostKeyChecking=yes -p {}",
            self.config.ssh_command,
            material.private_key.display(),
            material.known_hosts.display(),
            self.config.ssh_port
        );
        inv.arg("-e").arg(remote_shell);
        inv.arg(dir_contents(source));
        inv.arg(format!("{}@{}:.", self.config.ssh_user, address));
        inv
    }

    /// Preserve pass; None when the source has nothing to copy
    pub fn preserve_pass(&self, source: &Path, dest: &str) -> Result<Option<Invocation>> {
        let entries = top_level_entries(source, &self.config.excludes)?;
        if entries.is_empty() {
            return Ok(None);
        }

        let mut inv = Invocation::new("preserve pass", &self.config);
        self.push_archive_flags(&mut inv);
        self.push_excludes(&mut inv);
        for flag in REPORT_FLAGS {
            inv.arg(flag);
        }
        for entry in entries {
            inv.arg(entry);
        }
        inv.arg(dest);
        Ok(Some(inv))
    }

    /// Cleanup pass: removes destination-only files, transfers nothing
    pub fn cleanup_pass(&self, source: &Path, dest: &str) -> Invocation {
        let mut inv = Invocation::new("cleanup pass", &self.config);
        inv.arg("-rx");
        self.push_excludes(&mut inv);
        inv.arg("--ignore-existing")
            .arg("--ignore-non-existing")
            .arg("--delete");
        for flag in REPORT_FLAGS {
            inv.arg(flag);
        }
        inv.arg(dir_contents(source));
        inv.arg(dest);
        inv
    }

    /// Run one invocation to completion
    ///
    /// The child is not killed on cancellation; callers check the token
    /// between invocations.
    pub async fn run(&self, inv: &Invocation) -> Result<()> {
        info!("Starting rsync {}", inv.label);
        debug!("{} {:?}", inv.program, inv.args);

        let status = inv
            .command()
            .status()
            .await
            .map_err(|e| Error::Transfer(format!("{}: failed to start {}: {}", inv.label, inv.program, e)))?;

        if !status.success() {
            return Err(Error::Transfer(format!("{}: rsync {}", inv.label, status)));
        }

        info!("rsync {} complete", inv.label);
        Ok(())
    }

    /// Preserve pass followed by cleanup pass against `dest`
    pub async fn two_pass(
        &self,
        source: &Path,
        dest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cleanup = self.cleanup_pass(source, dest);

        if let Some(preserve) = self.preserve_pass(source, dest)? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run(&preserve).await?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.run(&cleanup).await
    }
}

/// `<dir>/` so rsync copies the contents rather than the directory itself
fn dir_contents(dir: &Path) -> OsString {
    let mut s = dir.as_os_str().to_os_string();
    if !s.to_string_lossy().ends_with('/') {
        s.push("/");
    }
    s
}

/// Sorted top-level entries of `dir`, minus reserved names
fn top_level_entries(dir: &Path, excludes: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Config(format!("source {:?} is not a directory", dir)));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if excludes.iter().any(|x| OsStr::new(x) == name) {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
