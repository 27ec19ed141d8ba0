use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Every path the upgrade pipeline touches, derived from one state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitLayout {
    root: PathBuf,
    install_dir: PathBuf,
}

impl ToolkitLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let install_dir = root.join("toolkit");
        Self { root, install_dir }
    }

    pub fn with_install_dir(mut self, install_dir: impl Into<PathBuf>) -> Self {
        self.install_dir = install_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("kitup.toml")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.backups_dir().join(backup_id)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn staging_path(&self, version: &str) -> PathBuf {
        self.staging_dir().join(version)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("upgrade.lock")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.backups_dir(),
            self.staging_dir(),
            self.tmp_dir(),
            self.state_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_root() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("KITUP_HOME") {
        return Ok(PathBuf::from(home));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows state root")?;
        return Ok(PathBuf::from(app_data).join("kitup"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state root")?;
    Ok(PathBuf::from(home).join(".kitup"))
}
