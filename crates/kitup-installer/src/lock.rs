use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use kitup_core::UpgradeError;
use tracing::{debug, warn};

use crate::fs_utils::unix_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub started_at_unix_ms: Option<u128>,
}

/// Advisory single-writer marker for an install. Released on drop.
#[derive(Debug)]
pub struct UpgradeLock {
    path: PathBuf,
}

impl UpgradeLock {
    /// Claims the lock at `path`. A marker left by a process that no longer
    /// runs is reclaimed once; a live owner yields [`UpgradeError::Locked`].
    pub fn acquire(path: &Path) -> Result<Self, UpgradeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        for attempt in 0..2 {
            match try_create(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired upgrade lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = read_lock_owner(path)?;
                    match owner {
                        Some(owner) if owner_process_alive(owner.pid)? => {
                            return Err(UpgradeError::Locked {
                                pid: owner.pid,
                                lock_path: path.to_path_buf(),
                            });
                        }
                        _ if attempt == 0 => {
                            warn!(path = %path.display(), owner = ?owner, "reclaiming stale upgrade lock");
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                                Err(err) => {
                                    return Err(anyhow::Error::new(err)
                                        .context(format!(
                                            "failed to remove stale lock: {}",
                                            path.display()
                                        ))
                                        .into());
                                }
                            }
                        }
                        _ => break,
                    }
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to claim upgrade lock: {}", path.display()))
                        .into());
                }
            }
        }

        Err(anyhow!("could not claim upgrade lock: {}", path.display()).into())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to release upgrade lock");
            }
        }
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let started = unix_millis().unwrap_or_default();
    file.write_all(format!("pid={}\nstarted_at_unix_ms={started}\n", std::process::id()).as_bytes())?;
    file.flush()
}

/// Reads the owner recorded in a lock file, `None` if absent or garbled.
pub fn read_lock_owner(path: &Path) -> Result<Option<LockOwner>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read lock: {}", path.display()));
        }
    };

    let mut pid = None;
    let mut started_at_unix_ms = None;
    for line in raw.lines() {
        match line.split_once('=') {
            Some(("pid", value)) => pid = value.trim().parse().ok(),
            Some(("started_at_unix_ms", value)) => started_at_unix_ms = value.trim().parse().ok(),
            _ => {}
        }
    }
    Ok(pid.map(|pid| LockOwner {
        pid,
        started_at_unix_ms,
    }))
}

fn owner_process_alive(pid: u32) -> Result<bool> {
    if pid == std::process::id() {
        return Ok(true);
    }

    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;
        Ok(status.success())
    }

    #[cfg(windows)]
    {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output()
            .with_context(|| format!("failed executing owner liveness probe for pid={pid}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "owner liveness probe failed for pid={pid}: status={}",
                output.status
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains(&format!("\"{pid}\"")))
    }
}
