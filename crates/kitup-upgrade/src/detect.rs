use std::path::{Path, PathBuf};

use kitup_core::{SourceAttempt, UpgradeError};
use kitup_registry::{inspect_local_source, stage_release, VersionSource};
use kitup_resolver::{TargetVersion, UpdateCheck};
use semver::Version;
use tracing::{info, warn};

use crate::{SourcePreference, UpgradeOrchestrator};

const REGISTRY_LABEL: &str = "registry";
const LOCAL_LABEL: &str = "local";

/// A source that resolved the requested target and whose files are on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSource {
    pub source: VersionSource,
    pub target: Version,
    pub files_dir: PathBuf,
    /// True when `files_dir` was downloaded into staging for this run.
    pub staged: bool,
}

impl UpgradeOrchestrator {
    /// Picks the source to upgrade from. `Auto` tries the registry and falls
    /// back to the configured local source; the error then names both.
    pub fn detect_source(
        &self,
        preference: &SourcePreference,
        target: &TargetVersion,
    ) -> Result<DetectedSource, UpgradeError> {
        match preference {
            SourcePreference::Registry => self.try_registry(target),
            SourcePreference::Local(path) => self.try_local(path.as_deref(), target),
            SourcePreference::Auto => {
                let mut attempts = Vec::new();
                match self.try_registry(target) {
                    Ok(detected) => return Ok(detected),
                    Err(err) => {
                        warn!(error = %err, "registry source unusable; trying local source");
                        attempts.push(source_attempt(REGISTRY_LABEL, &err));
                    }
                }
                match self.try_local(None, target) {
                    Ok(detected) => {
                        info!(source = %detected.source, "falling back to local source");
                        return Ok(detected);
                    }
                    Err(err) => attempts.push(source_attempt(LOCAL_LABEL, &err)),
                }
                Err(UpgradeError::NoUsableSource { attempts })
            }
        }
    }

    /// Compares the install against the preferred source without staging
    /// anything.
    pub fn check_for_updates(
        &self,
        preference: &SourcePreference,
    ) -> Result<(VersionSource, UpdateCheck), UpgradeError> {
        let candidates = match preference {
            SourcePreference::Registry => vec![(REGISTRY_LABEL, self.registry_source())],
            SourcePreference::Local(path) => {
                vec![(LOCAL_LABEL, self.local_source(path.as_deref()))]
            }
            SourcePreference::Auto => vec![
                (REGISTRY_LABEL, self.registry_source()),
                (LOCAL_LABEL, self.local_source(None)),
            ],
        };

        let single = candidates.len() == 1;
        let mut attempts = Vec::new();
        for (label, candidate) in candidates {
            let outcome = candidate.and_then(|source| {
                let check = self.resolver.check_for_updates(&source)?;
                Ok((source, check))
            });
            match outcome {
                Ok(found) => return Ok(found),
                Err(err) if single => return Err(err),
                Err(err) => attempts.push(source_attempt(label, &err)),
            }
        }
        Err(UpgradeError::NoUsableSource { attempts })
    }

    fn registry_source(&self) -> Result<VersionSource, UpgradeError> {
        match &self.settings.registry_url {
            Some(url) => Ok(VersionSource::RemoteRegistry { url: url.clone() }),
            None => Err(UpgradeError::SourceUnavailable {
                label: REGISTRY_LABEL.to_string(),
                reason: "no registry_url configured".to_string(),
            }),
        }
    }

    fn local_source(&self, explicit: Option<&Path>) -> Result<VersionSource, UpgradeError> {
        match explicit.or(self.settings.local_source.as_deref()) {
            Some(path) => Ok(VersionSource::LocalDirectory(path.to_path_buf())),
            None => Err(UpgradeError::SourceUnavailable {
                label: LOCAL_LABEL.to_string(),
                reason: "no local source configured".to_string(),
            }),
        }
    }

    fn try_registry(&self, target: &TargetVersion) -> Result<DetectedSource, UpgradeError> {
        let source = self.registry_source()?;
        let VersionSource::RemoteRegistry { url } = &source else {
            return Err(UpgradeError::SourceUnavailable {
                label: source.label(),
                reason: "not a registry source".to_string(),
            });
        };
        let version = self.resolver.resolve_target(&source, target)?;
        let unavailable = |err: anyhow::Error| UpgradeError::SourceUnavailable {
            label: source.label(),
            reason: format!("{err:#}"),
        };
        let client = self.resolver.client_for(url).map_err(unavailable)?;
        let destination = self.layout.staging_path(&version.to_string());
        let files_dir = stage_release(&client, &version, &destination).map_err(unavailable)?;

        let check = inspect_local_source(&files_dir, self.resolver.toolkit_name())?;
        let staged_version = check.manifest.as_ref().map(|manifest| &manifest.version);
        if !check.is_valid() || staged_version != Some(&version) {
            let mut problems = check.problems;
            if let Some(staged) = staged_version.filter(|staged| **staged != version) {
                problems.push(format!("release {version} ships manifest version {staged}"));
            }
            return Err(UpgradeError::SourceInvalid {
                label: source.label(),
                reason: problems.join("; "),
            });
        }

        info!(source = %source, version = %version, staged = %files_dir.display(), "staged registry release");
        Ok(DetectedSource {
            source,
            target: version,
            files_dir,
            staged: true,
        })
    }

    fn try_local(
        &self,
        explicit: Option<&Path>,
        target: &TargetVersion,
    ) -> Result<DetectedSource, UpgradeError> {
        let source = self.local_source(explicit)?;
        let version = self.resolver.resolve_target(&source, target)?;
        let VersionSource::LocalDirectory(path) = &source else {
            return Err(UpgradeError::SourceUnavailable {
                label: source.label(),
                reason: "not a local source".to_string(),
            });
        };
        let files_dir = path.clone();
        Ok(DetectedSource {
            source,
            target: version,
            files_dir,
            staged: false,
        })
    }
}

fn source_attempt(fallback_label: &str, err: &UpgradeError) -> SourceAttempt {
    let (label, reason) = match err {
        UpgradeError::SourceUnavailable { label, reason }
        | UpgradeError::SourceInvalid { label, reason } => (label.clone(), reason.clone()),
        other => (fallback_label.to_string(), other.to_string()),
    };
    SourceAttempt { label, reason }
}
