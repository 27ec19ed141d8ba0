//! Version-gated transformations of an install.
//!
//! `migrations.toml` names implementations by reference; references resolve
//! against a closed [`MigrationCatalog`] when the registry is loaded, so an
//! unknown reference fails before anything runs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kitup_core::{UpgradeError, CONFIG_FILE};
use semver::Version;
use serde::Deserialize;
use tracing::{error, info};

pub struct MigrationContext<'a> {
    pub install_dir: &'a Path,
    pub from_version: &'a Version,
    pub to_version: &'a Version,
}

pub type MigrationFn = fn(&MigrationContext<'_>) -> Result<()>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationDescriptor {
    pub version: Version,
    pub description: String,
    pub implementation: String,
}

/// A descriptor whose implementation has been resolved.
#[derive(Clone)]
pub struct Migration {
    pub descriptor: MigrationDescriptor,
    run: MigrationFn,
}

impl Migration {
    pub fn version(&self) -> &Version {
        &self.descriptor.version
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}

#[derive(Clone, Default)]
pub struct MigrationCatalog {
    implementations: BTreeMap<String, MigrationFn>,
}

impl MigrationCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.register("noop", noop);
        catalog.register("ensure_scripts_executable", ensure_scripts_executable);
        catalog.register("normalize_config_line_endings", normalize_config_line_endings);
        catalog
    }

    pub fn register(&mut self, name: impl Into<String>, implementation: MigrationFn) {
        self.implementations.insert(name.into(), implementation);
    }

    pub fn get(&self, name: &str) -> Option<MigrationFn> {
        self.implementations.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.implementations.keys().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrationsFile {
    #[serde(default)]
    migration: Vec<MigrationDescriptor>,
}

/// Ordered set of migrations keyed by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<Version, Migration>,
}

impl MigrationRegistry {
    pub fn from_toml_str(input: &str, catalog: &MigrationCatalog) -> Result<Self> {
        let parsed: MigrationsFile =
            toml::from_str(input).context("failed to parse migration registry")?;
        let mut migrations = BTreeMap::new();
        for descriptor in parsed.migration {
            let run = catalog.get(&descriptor.implementation).ok_or_else(|| {
                anyhow!(
                    "migration {} references unknown implementation '{}'",
                    descriptor.version,
                    descriptor.implementation
                )
            })?;
            if migrations.contains_key(&descriptor.version) {
                return Err(anyhow!(
                    "migration registry lists version {} more than once",
                    descriptor.version
                ));
            }
            migrations.insert(descriptor.version.clone(), Migration { descriptor, run });
        }
        Ok(Self { migrations })
    }

    /// Loads `path`; a missing registry file means no migrations.
    pub fn load(path: &Path, catalog: &MigrationCatalog) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw, catalog)
                .with_context(|| format!("invalid migration registry: {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read migration registry: {}", path.display())),
        }
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migrations with `from < version <= to`, ascending.
    pub fn get_applicable_migrations(&self, from: &Version, to: &Version) -> Vec<Migration> {
        if from >= to {
            return Vec::new();
        }
        self.migrations
            .iter()
            .filter(|(version, _)| *version > from && *version <= to)
            .map(|(_, migration)| migration.clone())
            .collect()
    }
}

/// Runs `migrations` in the given order and stops at the first failure.
/// Nothing is retried. The error carries the versions applied before it.
pub fn run_migrations(
    migrations: &[Migration],
    context: &MigrationContext<'_>,
) -> Result<Vec<Version>, UpgradeError> {
    let mut applied = Vec::new();
    for migration in migrations {
        let version = migration.version();
        info!(version = %version, description = %migration.descriptor.description, "running migration");
        if let Err(err) = (migration.run)(context) {
            error!(version = %version, applied = applied.len(), error = %format!("{err:#}"), "migration failed");
            return Err(UpgradeError::MigrationFailed {
                version: version.clone(),
                applied,
                reason: format!("{err:#}"),
            });
        }
        applied.push(version.clone());
    }
    Ok(applied)
}

fn noop(_context: &MigrationContext<'_>) -> Result<()> {
    Ok(())
}

fn ensure_scripts_executable(context: &MigrationContext<'_>) -> Result<()> {
    let scripts = context.install_dir.join("scripts");
    if !scripts.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&scripts)
        .with_context(|| format!("failed to read {}", scripts.display()))?
    {
        let entry = entry.with_context(|| format!("failed to iterate {}", scripts.display()))?;
        let path = entry.path();
        if !entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .is_file()
        {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            fs::set_permissions(&path, permissions)
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }
    }
    Ok(())
}

fn normalize_config_line_endings(context: &MigrationContext<'_>) -> Result<()> {
    let path = context.install_dir.join(CONFIG_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    if raw.contains("\r\n") {
        fs::write(&path, raw.replace("\r\n", "\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
