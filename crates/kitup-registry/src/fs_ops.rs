use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

/// Accepts only plain relative paths that stay inside their root.
pub(crate) fn safe_relative_path(raw: &str) -> Result<PathBuf> {
    if raw.trim().is_empty() {
        anyhow::bail!("release file path must not be empty");
    }

    let path = Path::new(raw);
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => anyhow::bail!("release file path escapes the release root: '{raw}'"),
        }
    }

    if normalized.as_os_str().is_empty() {
        anyhow::bail!("release file path must name a file: '{raw}'");
    }
    Ok(normalized)
}

pub(crate) fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
