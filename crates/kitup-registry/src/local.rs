use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use kitup_core::{ToolkitManifest, MANIFEST_FILE, REQUIRED_SUBDIRS};
use tracing::debug;

/// Outcome of inspecting a directory that claims to be a toolkit install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSourceCheck {
    pub manifest: Option<ToolkitManifest>,
    pub problems: Vec<String>,
}

impl LocalSourceCheck {
    pub fn is_valid(&self) -> bool {
        self.manifest.is_some() && self.problems.is_empty()
    }
}

/// Inspects `path` without failing for "not a valid install". Only I/O
/// errors other than a missing path are returned as `Err`.
pub fn inspect_local_source(path: &Path, expected_name: &str) -> Result<LocalSourceCheck> {
    let mut problems = Vec::new();

    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            problems.push(format!("{} is not a directory", path.display()));
            return Ok(LocalSourceCheck {
                manifest: None,
                problems,
            });
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            problems.push(format!("{} does not exist", path.display()));
            return Ok(LocalSourceCheck {
                manifest: None,
                problems,
            });
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat local source: {}", path.display()));
        }
    }

    let manifest_path = path.join(MANIFEST_FILE);
    let manifest = match fs::read_to_string(&manifest_path) {
        Ok(raw) => match ToolkitManifest::from_toml_str(&raw) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                problems.push(format!("{MANIFEST_FILE} is invalid: {err:#}"));
                None
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            problems.push(format!("{MANIFEST_FILE} is missing"));
            None
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read source manifest: {}", manifest_path.display())
            });
        }
    };

    if let Some(manifest) = &manifest {
        if manifest.name != expected_name {
            problems.push(format!(
                "manifest name '{}' does not match expected '{}'",
                manifest.name, expected_name
            ));
        }
    }

    for subdir in REQUIRED_SUBDIRS {
        let subdir_path = path.join(subdir);
        match fs::metadata(&subdir_path) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => problems.push(format!("{subdir} is not a directory")),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                problems.push(format!("required directory {subdir}/ is missing"));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to stat source directory: {}", subdir_path.display())
                });
            }
        }
    }

    debug!(
        path = %path.display(),
        problems = problems.len(),
        "inspected local source"
    );
    Ok(LocalSourceCheck { manifest, problems })
}

pub fn validate_local_source(path: &Path, expected_name: &str) -> Result<bool> {
    Ok(inspect_local_source(path, expected_name)?.is_valid())
}
