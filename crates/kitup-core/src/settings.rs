use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const MAX_COUNT_TOLERANCE_PERCENT: f64 = 25.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeSettings {
    pub toolkit_name: String,
    pub registry_url: Option<String>,
    /// Alternate install tried when the registry is unusable.
    pub local_source: Option<PathBuf>,
    pub remote_timeout_ms: u64,
    pub backup_count_tolerance_percent: f64,
    pub backup_exclusions: Vec<String>,
    pub keep_backups: usize,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            toolkit_name: "toolkit".to_string(),
            registry_url: None,
            local_source: None,
            remote_timeout_ms: 3_000,
            backup_count_tolerance_percent: 0.0,
            backup_exclusions: vec![
                "cache/**".to_string(),
                "node_modules/**".to_string(),
                ".venv/**".to_string(),
            ],
            keep_backups: 5,
        }
    }
}

impl UpgradeSettings {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Self = toml::from_str(input).context("failed to parse kitup settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads the settings file if present; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw).with_context(|| format!("invalid settings: {}", path.display()))
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("KITUP_REGISTRY_URL").filter(|url| !url.trim().is_empty()) {
            self.registry_url = Some(url.trim().to_string());
        }
        if let Some(path) = lookup("KITUP_LOCAL_SOURCE").filter(|path| !path.trim().is_empty()) {
            self.local_source = Some(PathBuf::from(path.trim()));
        }
        self
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.remote_timeout_ms == 0 {
            return Err(anyhow!("remote_timeout_ms must be greater than zero"));
        }
        if !(0.0..=MAX_COUNT_TOLERANCE_PERCENT).contains(&self.backup_count_tolerance_percent) {
            return Err(anyhow!(
                "backup_count_tolerance_percent must be between 0 and {MAX_COUNT_TOLERANCE_PERCENT}, got {}",
                self.backup_count_tolerance_percent
            ));
        }
        if self.keep_backups == 0 {
            return Err(anyhow!("keep_backups must be at least 1"));
        }
        if let Some(url) = &self.registry_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("registry_url must be an http(s) URL: {url}"));
            }
        }
        Ok(())
    }
}
