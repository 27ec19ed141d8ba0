use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use kitup_core::{
    BumpKind, ToolkitLayout, ToolkitManifest, UpgradeError, UpgradeSettings, VersionInfo,
    MANIFEST_FILE,
};
use kitup_registry::{inspect_local_source, RegistryClient, VersionSource};
use semver::Version;
use tracing::{debug, info, warn};

use crate::TargetVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub info: VersionInfo,
    pub has_update: bool,
    pub bump: BumpKind,
}

/// Answers "what is installed" and "what can be installed" for one install.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    install_dir: PathBuf,
    toolkit_name: String,
    remote_timeout: Duration,
}

impl VersionResolver {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        toolkit_name: impl Into<String>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            toolkit_name: toolkit_name.into(),
            remote_timeout,
        }
    }

    pub fn from_settings(layout: &ToolkitLayout, settings: &UpgradeSettings) -> Self {
        Self::new(
            layout.install_dir(),
            settings.toolkit_name.clone(),
            settings.remote_timeout(),
        )
    }

    pub fn toolkit_name(&self) -> &str {
        &self.toolkit_name
    }

    pub fn current_manifest(&self) -> Result<ToolkitManifest, UpgradeError> {
        let path = self.install_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|err| UpgradeError::ManifestMissing {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        ToolkitManifest::from_toml_str(&raw).map_err(|err| UpgradeError::ManifestMissing {
            path,
            reason: format!("{err:#}"),
        })
    }

    pub fn get_current_version(&self) -> Result<Version, UpgradeError> {
        Ok(self.current_manifest()?.version)
    }

    /// Latest version a source offers, `None` when it cannot tell.
    pub fn get_latest_version(&self, source: &VersionSource) -> Option<Version> {
        match source {
            VersionSource::RemoteRegistry { url } => match self.client_for(url) {
                Ok(client) => client.latest_version(),
                Err(err) => {
                    warn!(registry = %url, error = %format!("{err:#}"), "cannot build registry client");
                    None
                }
            },
            VersionSource::LocalDirectory(path) => read_local_manifest_version(path),
        }
    }

    pub fn check_for_updates(&self, source: &VersionSource) -> Result<UpdateCheck, UpgradeError> {
        let current = self.get_current_version()?;
        let latest =
            self.get_latest_version(source)
                .ok_or_else(|| UpgradeError::SourceUnavailable {
                    label: source.label(),
                    reason: "no version reported".to_string(),
                })?;
        let info = VersionInfo::new(current, latest);
        info!(
            current = %info.current(),
            latest = %info.latest(),
            bump = %info.bump(),
            source = %source,
            "checked for updates"
        );
        Ok(UpdateCheck {
            has_update: info.has_update(),
            bump: info.bump(),
            info,
        })
    }

    pub fn check_source_availability(&self, source: &VersionSource) -> bool {
        let available = match source {
            VersionSource::RemoteRegistry { url } => self
                .client_for(url)
                .map(|client| client.is_reachable())
                .unwrap_or(false),
            VersionSource::LocalDirectory(path) => path.is_dir(),
        };
        debug!(source = %source, available, "probed version source");
        available
    }

    pub fn validate_local_source(&self, path: &Path) -> Result<bool> {
        let check = inspect_local_source(path, &self.toolkit_name)?;
        if !check.is_valid() {
            debug!(path = %path.display(), problems = ?check.problems, "local source rejected");
        }
        Ok(check.is_valid())
    }

    /// Resolves the concrete version `request` names within `source`.
    pub fn resolve_target(
        &self,
        source: &VersionSource,
        request: &TargetVersion,
    ) -> Result<Version, UpgradeError> {
        let (latest, available) = match source {
            VersionSource::RemoteRegistry { url } => {
                let client = self.client_for(url)?;
                let index = client
                    .fetch_index()
                    .map_err(|err| UpgradeError::SourceUnavailable {
                        label: source.label(),
                        reason: format!("{err:#}"),
                    })?;
                if index.name != self.toolkit_name {
                    return Err(UpgradeError::SourceInvalid {
                        label: source.label(),
                        reason: format!(
                            "registry publishes '{}' instead of '{}'",
                            index.name, self.toolkit_name
                        ),
                    });
                }
                (index.latest, index.releases)
            }
            VersionSource::LocalDirectory(path) => {
                let check = inspect_local_source(path, &self.toolkit_name)?;
                let problems = check.problems.join("; ");
                match check.manifest {
                    Some(manifest) if problems.is_empty() => (manifest.version, Vec::new()),
                    _ => {
                        return Err(UpgradeError::SourceInvalid {
                            label: source.label(),
                            reason: problems,
                        });
                    }
                }
            }
        };

        request
            .select(&latest, &available)
            .cloned()
            .ok_or_else(|| UpgradeError::SourceInvalid {
                label: source.label(),
                reason: format!("no release matches target '{request}' (latest is {latest})"),
            })
    }

    pub fn client_for(&self, url: &str) -> Result<RegistryClient> {
        RegistryClient::new(url, self.remote_timeout)
    }
}

fn read_local_manifest_version(path: &Path) -> Option<Version> {
    let manifest_path = path.join(MANIFEST_FILE);
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %manifest_path.display(), error = %err, "failed to read local source manifest");
            }
            return None;
        }
    };
    ToolkitManifest::from_toml_str(&raw)
        .map(|manifest| manifest.version)
        .ok()
}
