use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kitup_core::{UpgradeError, CONFIG_DEFAULTS_FILE, CONFIG_FILE, DEFAULTS_DIR};
use tracing::{debug, info, warn};

use crate::exclude::PathExclusions;
use crate::fs_utils::{list_tree_files, prune_empty_parents};
use crate::merge::{merge_config_str, tables_equal, MergedConfig};
use crate::strategy::{FileStrategy, StrategyTable};

/// A file whose new content is computed ahead of time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMerge {
    pub path: String,
    pub merged: MergedConfig,
    pub contents: String,
    /// False when the merge reproduces what is installed.
    pub changed: bool,
}

/// What applying an incoming tree to an install will do, per file. Building
/// one reads both trees and writes nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePlan {
    pub install_dir: PathBuf,
    pub incoming_dir: PathBuf,
    pub files_to_overwrite: Vec<String>,
    pub files_to_preserve: Vec<String>,
    pub files_to_merge: Vec<PlannedMerge>,
    pub files_to_remove: Vec<String>,
    /// Replays the user's config edits onto the new shipped defaults.
    pub config_merge: Option<PlannedMerge>,
}

impl FilePlan {
    pub fn total_files(&self) -> usize {
        self.files_to_overwrite.len()
            + self.files_to_preserve.len()
            + self.files_to_merge.len()
            + self.files_to_remove.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub overwritten: usize,
    pub merged: usize,
    pub removed: usize,
    pub config_rewritten: bool,
}

#[derive(Debug, Clone)]
pub struct FileMerger {
    table: StrategyTable,
    exclusions: PathExclusions,
}

impl FileMerger {
    pub fn new(table: StrategyTable, exclusions: PathExclusions) -> Self {
        Self { table, exclusions }
    }

    pub fn strategy_table(&self) -> &StrategyTable {
        &self.table
    }

    pub fn determine_file_strategy(&self, relative_path: &str) -> Result<FileStrategy, UpgradeError> {
        self.table.determine_file_strategy(relative_path)
    }

    pub fn merge_config(&self, base: &str, user: &str, incoming: &str) -> Result<MergedConfig, UpgradeError> {
        merge_config_str(CONFIG_FILE, base, user, incoming)
    }

    pub fn plan_files(&self, install_dir: &Path, incoming_dir: &Path) -> Result<FilePlan, UpgradeError> {
        let skip = |relative: &str| self.exclusions.is_excluded(relative);
        let installed = list_tree_files(install_dir, &skip)?;
        let incoming = list_tree_files(incoming_dir, &skip)?;
        self.table
            .validate_paths(installed.iter().map(String::as_str))?;
        self.table
            .validate_paths(incoming.iter().map(String::as_str))?;

        let installed_set: BTreeSet<&str> = installed.iter().map(String::as_str).collect();
        let incoming_set: BTreeSet<&str> = incoming.iter().map(String::as_str).collect();

        let mut plan = FilePlan {
            install_dir: install_dir.to_path_buf(),
            incoming_dir: incoming_dir.to_path_buf(),
            files_to_overwrite: Vec::new(),
            files_to_preserve: Vec::new(),
            files_to_merge: Vec::new(),
            files_to_remove: Vec::new(),
            config_merge: None,
        };

        for path in &incoming {
            let present = installed_set.contains(path.as_str());
            match self.table.determine_file_strategy(path)? {
                FileStrategy::Overwrite => plan.files_to_overwrite.push(path.clone()),
                // A preserved or merged file the install lacks is seeded
                // from the incoming tree.
                FileStrategy::Preserve | FileStrategy::Merge if !present => {
                    plan.files_to_overwrite.push(path.clone())
                }
                FileStrategy::Preserve => plan.files_to_preserve.push(path.clone()),
                FileStrategy::Merge => {
                    plan.files_to_merge
                        .push(self.plan_merge(install_dir, incoming_dir, path)?);
                }
            }
        }

        for path in &installed {
            if incoming_set.contains(path.as_str()) {
                continue;
            }
            match self.table.determine_file_strategy(path)? {
                FileStrategy::Overwrite => plan.files_to_remove.push(path.clone()),
                FileStrategy::Preserve | FileStrategy::Merge => {
                    plan.files_to_preserve.push(path.clone())
                }
            }
        }
        plan.files_to_preserve.sort();

        if installed_set.contains(CONFIG_FILE) {
            plan.config_merge = self.plan_config_merge(install_dir, incoming_dir)?;
        }

        debug!(
            overwrite = plan.files_to_overwrite.len(),
            preserve = plan.files_to_preserve.len(),
            merge = plan.files_to_merge.len(),
            remove = plan.files_to_remove.len(),
            config_merge = plan.config_merge.is_some(),
            "planned file changes"
        );
        Ok(plan)
    }

    fn plan_merge(&self, install_dir: &Path, incoming_dir: &Path, path: &str) -> Result<PlannedMerge, UpgradeError> {
        let user = read_text(&install_dir.join(path))?;
        let incoming = read_text(&incoming_dir.join(path))?;
        let base = read_optional_text(&install_dir.join(DEFAULTS_DIR).join(path))?
            .unwrap_or_else(|| incoming.clone());
        let merged = merge_config_str(path, &base, &user, &incoming)?;
        planned_merge(path, merged, &user)
    }

    fn plan_config_merge(&self, install_dir: &Path, incoming_dir: &Path) -> Result<Option<PlannedMerge>, UpgradeError> {
        let Some(incoming) = read_optional_text(&incoming_dir.join(CONFIG_DEFAULTS_FILE))? else {
            return Ok(None);
        };
        let user = read_text(&install_dir.join(CONFIG_FILE))?;
        let base = read_optional_text(&install_dir.join(CONFIG_DEFAULTS_FILE))?
            .unwrap_or_else(|| incoming.clone());
        let merged = merge_config_str(CONFIG_FILE, &base, &user, &incoming)?;
        planned_merge(CONFIG_FILE, merged, &user).map(Some)
    }

    /// Carries out a plan against its install directory. This is the only
    /// operation of the merger that writes.
    pub fn apply_upgrade(&self, plan: &FilePlan) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        // Removals go first so a release may turn a dropped file into a
        // directory of the same name, or the other way round.
        for path in &plan.files_to_remove {
            let target = plan.install_dir.join(path);
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", target.display()));
                }
            }
            prune_empty_parents(&plan.install_dir, &target, &plan.incoming_dir);
            summary.removed += 1;
        }

        for path in &plan.files_to_overwrite {
            let source = plan.incoming_dir.join(path);
            let destination = plan.install_dir.join(path);
            clear_destination(&plan.install_dir, &destination)?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory: {}", parent.display()))?;
            }
            fs::copy(&source, &destination).with_context(|| {
                format!("failed to copy {} to {}", source.display(), destination.display())
            })?;
            summary.overwritten += 1;
        }

        for merge in plan.files_to_merge.iter().chain(plan.config_merge.iter()) {
            if !merge.changed {
                continue;
            }
            let destination = plan.install_dir.join(&merge.path);
            fs::write(&destination, &merge.contents)
                .with_context(|| format!("failed to write merged {}", destination.display()))?;
            if merge.path == CONFIG_FILE {
                summary.config_rewritten = true;
            } else {
                summary.merged += 1;
            }
        }

        info!(
            overwritten = summary.overwritten,
            merged = summary.merged,
            removed = summary.removed,
            config_rewritten = summary.config_rewritten,
            "applied file plan"
        );
        Ok(summary)
    }
}

fn planned_merge(path: &str, merged: MergedConfig, user: &str) -> Result<PlannedMerge, UpgradeError> {
    let contents = merged
        .to_toml_string()
        .with_context(|| format!("failed to serialize merged {path}"))?;
    let unchanged = toml::from_str::<toml::Table>(user)
        .map(|installed| tables_equal(&installed, &merged.merged))
        .unwrap_or(false);
    Ok(PlannedMerge {
        path: path.to_string(),
        changed: !unchanged,
        merged,
        contents,
    })
}

/// Makes room for a file at `destination`: non-directory entries standing
/// where an ancestor directory must go are removed, as is an empty
/// directory at the destination itself. A non-empty directory is an error.
fn clear_destination(install_dir: &Path, destination: &Path) -> Result<()> {
    let Ok(relative) = destination.strip_prefix(install_dir) else {
        return Ok(());
    };
    let mut current = install_dir.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        current.push(component);
        let metadata = match fs::symlink_metadata(&current) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", current.display()));
            }
        };
        let is_destination = components.peek().is_none();
        if is_destination && metadata.is_dir() {
            warn!(path = %current.display(), "replacing empty directory with a file");
            fs::remove_dir(&current).with_context(|| {
                format!("directory stands where a file must go: {}", current.display())
            })?;
        } else if !is_destination && !current.is_dir() {
            warn!(path = %current.display(), "replacing file with a directory");
            fs::remove_file(&current)
                .with_context(|| format!("failed to remove {}", current.display()))?;
            return Ok(());
        }
    }
    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_optional_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}
