use std::path::PathBuf;

use kitup_installer::{FilePlan, Migration, PlannedMerge};
use kitup_registry::VersionSource;
use semver::Version;

/// Everything an upgrade would do. Computing it writes nothing to the
/// install.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradePlan {
    pub from_version: Version,
    pub to_version: Version,
    pub source: VersionSource,
    /// Directory the new version's files are read from.
    pub incoming_dir: PathBuf,
    pub files: FilePlan,
    pub applicable_migrations: Vec<Migration>,
    pub dry_run: bool,
}

impl UpgradePlan {
    pub fn files_to_overwrite(&self) -> &[String] {
        &self.files.files_to_overwrite
    }

    pub fn files_to_preserve(&self) -> &[String] {
        &self.files.files_to_preserve
    }

    pub fn files_to_merge(&self) -> &[PlannedMerge] {
        &self.files.files_to_merge
    }

    pub fn files_to_remove(&self) -> &[String] {
        &self.files.files_to_remove
    }

    pub fn migration_versions(&self) -> Vec<Version> {
        self.applicable_migrations
            .iter()
            .map(|migration| migration.version().clone())
            .collect()
    }

    fn mode(&self) -> &'static str {
        if self.dry_run {
            "dry-run"
        } else {
            "apply"
        }
    }
}

/// Line-oriented `key=value` rendering of a plan. Ordering is stable so the
/// output can be diffed and grepped.
pub fn render_plan_lines(plan: &UpgradePlan) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!(
        "upgrade_preview from={} to={} mode={} source={}",
        plan.from_version,
        plan.to_version,
        plan.mode(),
        plan.source
    ));
    lines.push(format!(
        "upgrade_summary overwrite={} preserve={} merge={} remove={} migrations={}",
        plan.files_to_overwrite().len(),
        plan.files_to_preserve().len(),
        plan.files_to_merge().len(),
        plan.files_to_remove().len(),
        plan.applicable_migrations.len()
    ));

    for path in plan.files_to_overwrite() {
        lines.push(format!("change_overwrite path={path}"));
    }
    for path in plan.files_to_preserve() {
        lines.push(format!("change_preserve path={path}"));
    }
    for merge in plan.files_to_merge() {
        lines.push(format!(
            "change_merge path={} changed={}",
            merge.path, merge.changed
        ));
    }
    for path in plan.files_to_remove() {
        lines.push(format!("change_remove path={path}"));
    }

    match &plan.files.config_merge {
        Some(merge) => lines.push(format!(
            "config_merge path={} outcome={} kept_user_keys={} incoming_changes={}",
            merge.path,
            if merge.changed { "rewrite" } else { "unchanged" },
            join_or_none(&merge.merged.kept_user_keys),
            join_or_none(&merge.merged.incoming_changes)
        )),
        None => lines.push("config_merge outcome=skipped".to_string()),
    }

    for (index, migration) in plan.applicable_migrations.iter().enumerate() {
        lines.push(format!(
            "migration order={} version={} implementation={} description={:?}",
            index + 1,
            migration.version(),
            migration.descriptor.implementation,
            migration.descriptor.description
        ));
    }

    lines
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.join(",")
    }
}
