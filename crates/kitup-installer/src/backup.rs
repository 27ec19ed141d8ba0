//! Point-in-time snapshots of the installed asset tree.
//!
//! A backup lives at `<backups>/<id>/` with the copied tree under `tree/` and
//! its metadata in `backup.json`. Snapshots are assembled in
//! `<backups>/.tmp-<id>` and renamed into place after the metadata is
//! written, so a directory without `.tmp-` and with metadata is complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kitup_core::{is_noise_file, ToolkitLayout, ToolkitManifest, UpgradeError, UpgradeSettings, CRITICAL_PATHS};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::exclude::PathExclusions;
use crate::fs_utils::{copy_tree, copy_tree_filtered, list_tree_files, remove_path_if_exists, unix_millis};

pub const BACKUP_METADATA_FILE: &str = "backup.json";
pub const BACKUP_TREE_DIR: &str = "tree";
const STAGING_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub source_version: Version,
    pub created_at_unix_ms: u64,
    pub file_count: u64,
    pub excluded_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub metadata: BackupMetadata,
    pub path: PathBuf,
}

impl Backup {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn tree_path(&self) -> PathBuf {
        self.path.join(BACKUP_TREE_DIR)
    }
}

/// Structured answer of [`BackupManager::validate_backup`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackupValidation {
    pub path: PathBuf,
    pub metadata: Option<BackupMetadata>,
    pub observed_file_count: Option<u64>,
    pub tolerance_percent: f64,
    pub missing_critical: Vec<String>,
    pub problems: Vec<String>,
}

impl BackupValidation {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn backup_id(&self) -> String {
        match &self.metadata {
            Some(metadata) => metadata.id.clone(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListedBackup {
    pub id: String,
    pub path: PathBuf,
    pub metadata: Option<BackupMetadata>,
    pub validation: BackupValidation,
}

impl ListedBackup {
    pub fn is_valid(&self) -> bool {
        self.validation.is_valid()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Carry excluded subtrees (dependency caches and the like) of the tree
    /// being replaced over into the restored tree.
    pub preserve_regenerable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub restored_files: u64,
    pub preserved_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    backups_dir: PathBuf,
    tmp_dir: PathBuf,
    exclusions: PathExclusions,
    tolerance_percent: f64,
}

impl BackupManager {
    pub fn new(
        backups_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        exclusions: PathExclusions,
        tolerance_percent: f64,
    ) -> Self {
        Self {
            backups_dir: backups_dir.into(),
            tmp_dir: tmp_dir.into(),
            exclusions,
            tolerance_percent,
        }
    }

    pub fn from_settings(layout: &ToolkitLayout, settings: &UpgradeSettings) -> Result<Self> {
        Ok(Self::new(
            layout.backups_dir(),
            layout.tmp_dir(),
            PathExclusions::new(&settings.backup_exclusions)?,
            settings.backup_count_tolerance_percent,
        ))
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    pub fn exclusions(&self) -> &PathExclusions {
        &self.exclusions
    }

    pub fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.backups_dir.join(backup_id)
    }

    pub fn create_backup(&self, source_dir: &Path) -> Result<Backup> {
        let manifest = ToolkitManifest::read_from_dir(source_dir)
            .with_context(|| format!("cannot back up {}", source_dir.display()))?;
        fs::create_dir_all(&self.backups_dir).with_context(|| {
            format!("failed to create backups dir: {}", self.backups_dir.display())
        })?;

        let created_at_unix_ms = u64::try_from(unix_millis()?).context("timestamp overflow")?;
        let id = self.allocate_id(created_at_unix_ms);
        let staging = self.backups_dir.join(format!("{STAGING_PREFIX}{id}"));
        let final_path = self.backup_path(&id);

        let result = self.write_backup(source_dir, &staging, &id, &manifest.version, created_at_unix_ms);
        let metadata = match result {
            Ok(metadata) => metadata,
            Err(err) => {
                if let Err(cleanup_err) = remove_path_if_exists(&staging) {
                    warn!(path = %staging.display(), error = %format!("{cleanup_err:#}"), "failed to clean up partial backup");
                }
                return Err(err);
            }
        };

        fs::rename(&staging, &final_path).with_context(|| {
            format!(
                "failed to finalize backup {} -> {}",
                staging.display(),
                final_path.display()
            )
        })?;

        info!(
            backup_id = %id,
            version = %metadata.source_version,
            files = metadata.file_count,
            path = %final_path.display(),
            "created backup"
        );
        Ok(Backup {
            metadata,
            path: final_path,
        })
    }

    fn allocate_id(&self, created_at_unix_ms: u64) -> String {
        let base = format!("backup-{created_at_unix_ms}");
        let mut id = base.clone();
        let mut attempt = 1;
        while self.backup_path(&id).exists()
            || self
                .backups_dir
                .join(format!("{STAGING_PREFIX}{id}"))
                .exists()
        {
            id = format!("{base}-{attempt}");
            attempt += 1;
        }
        id
    }

    fn write_backup(
        &self,
        source_dir: &Path,
        staging: &Path,
        id: &str,
        version: &Version,
        created_at_unix_ms: u64,
    ) -> Result<BackupMetadata> {
        remove_path_if_exists(staging)?;
        let tree = staging.join(BACKUP_TREE_DIR);
        let skip = |relative: &str| self.exclusions.is_excluded(relative) || is_noise_path(relative);
        let file_count = copy_tree_filtered(source_dir, &tree, &skip)?;

        let metadata = BackupMetadata {
            id: id.to_string(),
            source_version: version.clone(),
            created_at_unix_ms,
            file_count,
            excluded_patterns: self.exclusions.patterns().to_vec(),
        };
        let encoded =
            serde_json::to_vec_pretty(&metadata).context("failed to encode backup metadata")?;
        let metadata_path = staging.join(BACKUP_METADATA_FILE);
        fs::write(&metadata_path, encoded)
            .with_context(|| format!("failed to write {}", metadata_path.display()))?;
        Ok(metadata)
    }

    /// Checks a backup in order: existence, metadata, critical paths, then
    /// file count. Only unexpected I/O errors are returned as `Err`.
    pub fn validate_backup(&self, backup_path: &Path) -> Result<BackupValidation> {
        let mut report = BackupValidation {
            path: backup_path.to_path_buf(),
            metadata: None,
            observed_file_count: None,
            tolerance_percent: self.tolerance_percent,
            missing_critical: Vec::new(),
            problems: Vec::new(),
        };

        if !backup_path.is_dir() {
            report
                .problems
                .push(format!("backup {} does not exist", backup_path.display()));
            return Ok(report);
        }

        let metadata_path = backup_path.join(BACKUP_METADATA_FILE);
        let metadata = match fs::read(&metadata_path) {
            Ok(raw) => match serde_json::from_slice::<BackupMetadata>(&raw) {
                Ok(metadata) => metadata,
                Err(err) => {
                    report
                        .problems
                        .push(format!("{BACKUP_METADATA_FILE} is unreadable: {err}"));
                    return Ok(report);
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                report
                    .problems
                    .push(format!("{BACKUP_METADATA_FILE} is missing"));
                return Ok(report);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", metadata_path.display()));
            }
        };
        let recorded = metadata.file_count;
        report.metadata = Some(metadata);

        let tree = backup_path.join(BACKUP_TREE_DIR);
        for critical in CRITICAL_PATHS {
            if fs::symlink_metadata(tree.join(critical)).is_err() {
                report.missing_critical.push(critical.to_string());
            }
        }
        if !report.missing_critical.is_empty() {
            report.problems.push(format!(
                "critical paths missing: {}",
                report.missing_critical.join(", ")
            ));
            return Ok(report);
        }

        let observed = list_tree_files(&tree, &|_| false)?.len() as u64;
        report.observed_file_count = Some(observed);
        if !count_within_tolerance(recorded, observed, self.tolerance_percent) {
            report.problems.push(format!(
                "file count {observed} differs from recorded {recorded} beyond {}% tolerance",
                self.tolerance_percent
            ));
        }

        debug!(
            path = %backup_path.display(),
            valid = report.is_valid(),
            recorded,
            observed,
            "validated backup"
        );
        Ok(report)
    }

    /// Replaces `target_dir` with the contents of a validated backup.
    ///
    /// Whatever occupied `target_dir` is copied aside first; if the copy from
    /// the backup fails the target is put back from that copy before the
    /// error is returned.
    pub fn restore_backup(
        &self,
        backup_path: &Path,
        target_dir: &Path,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome, UpgradeError> {
        let validation = self.validate_backup(backup_path)?;
        let backup_id = validation.backup_id();
        if !validation.is_valid() {
            return Err(UpgradeError::BackupValidationFailed {
                backup_id,
                problems: validation.problems,
            });
        }

        fs::create_dir_all(&self.tmp_dir)
            .with_context(|| format!("failed to create {}", self.tmp_dir.display()))?;
        let safety = self
            .tmp_dir
            .join(format!("restore-safety-{backup_id}-{}", unix_millis()?));
        let had_target = target_dir.exists();
        if had_target {
            remove_path_if_exists(&safety)?;
            copy_tree(target_dir, &safety).with_context(|| {
                format!("failed to copy {} aside before restore", target_dir.display())
            })?;
        }

        let restored = match self.replace_tree(&backup_path.join(BACKUP_TREE_DIR), target_dir) {
            Ok(count) => count,
            Err(err) => {
                error!(backup_id = %backup_id, error = %format!("{err:#}"), "restore copy failed; reinstating previous tree");
                if had_target {
                    if let Err(recovery_err) = self.replace_tree(&safety, target_dir) {
                        return Err(anyhow!(
                            "restore of {backup_id} failed ({err:#}) and reinstating the previous tree also failed ({recovery_err:#}); it is kept at {}",
                            safety.display()
                        )
                        .into());
                    }
                    remove_path_if_exists(&safety)?;
                }
                return Err(err
                    .context(format!("failed to restore backup {backup_id}"))
                    .into());
            }
        };

        let mut preserved_paths = Vec::new();
        if had_target {
            self.reapply_untracked(
                &safety,
                &safety,
                target_dir,
                options.preserve_regenerable,
                &mut preserved_paths,
            )?;
            remove_path_if_exists(&safety)?;
        }

        info!(
            backup_id = %backup_id,
            target = %target_dir.display(),
            files = restored,
            preserved = preserved_paths.len(),
            "restored backup"
        );
        Ok(RestoreOutcome {
            backup_id,
            restored_files: restored,
            preserved_paths,
        })
    }

    fn replace_tree(&self, from: &Path, target_dir: &Path) -> Result<u64> {
        remove_path_if_exists(target_dir)?;
        copy_tree(from, target_dir)
    }

    /// Copies back what backups never hold: OS noise files always, excluded
    /// subtrees only when `regenerable` is set. Only the latter are reported
    /// in `preserved`.
    fn reapply_untracked(
        &self,
        root: &Path,
        dir: &Path,
        target_dir: &Path,
        regenerable: bool,
        preserved: &mut Vec<String>,
    ) -> Result<()> {
        for entry in
            fs::read_dir(dir).with_context(|| format!("failed to read directory: {}", dir.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", dir.display()))?;
            let path = entry.path();
            let relative = kitup_security::normalize_relative_path(
                path.strip_prefix(root)
                    .with_context(|| format!("{} is outside {}", path.display(), root.display()))?,
            );
            let destination = target_dir.join(&relative);
            let vacant = fs::symlink_metadata(&destination).is_err();
            if self.exclusions.is_excluded(&relative) {
                if regenerable && vacant {
                    copy_tree(&path, &destination)?;
                    preserved.push(relative);
                }
                continue;
            }
            if is_noise_path(&relative) {
                if vacant && destination.parent().is_some_and(Path::is_dir) {
                    copy_tree(&path, &destination)?;
                }
                continue;
            }
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                self.reapply_untracked(root, &path, target_dir, regenerable, preserved)?;
            }
        }
        Ok(())
    }

    /// Every backup directory with its metadata and validity, newest first.
    pub fn list_backups(&self) -> Result<Vec<ListedBackup>> {
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read backups dir: {}", self.backups_dir.display())
                });
            }
        };

        let mut listed = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to iterate backups dir: {}", self.backups_dir.display())
            })?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with(STAGING_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            let validation = self.validate_backup(&entry.path())?;
            listed.push(ListedBackup {
                id,
                path: entry.path(),
                metadata: validation.metadata.clone(),
                validation,
            });
        }

        listed.sort_by(|left, right| {
            let left_key = left.metadata.as_ref().map(|m| m.created_at_unix_ms);
            let right_key = right.metadata.as_ref().map(|m| m.created_at_unix_ms);
            right_key
                .cmp(&left_key)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(listed)
    }

    pub fn find_backup(&self, backup_id: &str) -> Result<PathBuf> {
        validate_backup_id(backup_id)?;
        let path = self.backup_path(backup_id);
        if !path.is_dir() {
            return Err(anyhow!("backup '{backup_id}' not found in {}", self.backups_dir.display()));
        }
        Ok(path)
    }

    pub fn remove_backup(&self, backup_id: &str) -> Result<()> {
        let path = self.find_backup(backup_id)?;
        remove_path_if_exists(&path)?;
        info!(backup_id, "removed backup");
        Ok(())
    }

    /// Deletes valid backups beyond the newest `keep`. Invalid entries are
    /// left for manual inspection. Returns the removed ids.
    pub fn prune_backups(&self, keep: usize) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for backup in self
            .list_backups()?
            .into_iter()
            .filter(ListedBackup::is_valid)
            .skip(keep)
        {
            remove_path_if_exists(&backup.path)?;
            removed.push(backup.id);
        }
        if !removed.is_empty() {
            info!(keep, removed = removed.len(), "pruned backups");
        }
        Ok(removed)
    }
}

fn validate_backup_id(backup_id: &str) -> Result<()> {
    let valid = !backup_id.is_empty()
        && !backup_id.starts_with('.')
        && backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid backup id '{backup_id}'"))
    }
}

fn is_noise_path(relative: &str) -> bool {
    relative
        .rsplit('/')
        .next()
        .is_some_and(is_noise_file)
}

fn count_within_tolerance(recorded: u64, observed: u64, tolerance_percent: f64) -> bool {
    let allowed = (recorded as f64 * tolerance_percent / 100.0).floor() as u64;
    recorded.abs_diff(observed) <= allowed
}
