use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kitup_security::verify_sha256;
use semver::Version;
use tracing::{debug, info};

use crate::{safe_relative_path, unique_suffix, RegistryClient};

/// Downloads one release into `destination`, verifying each file digest.
/// Files land in a sibling temp directory first and are renamed into place
/// only after every file verified; an existing destination is replaced.
pub fn stage_release(
    client: &RegistryClient,
    version: &Version,
    destination: &Path,
) -> Result<PathBuf> {
    let parent = destination
        .parent()
        .with_context(|| format!("staging path has no parent: {}", destination.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create staging root {}", parent.display()))?;

    let staged_root = parent.join(format!(".{version}-partial-{}", unique_suffix()));
    if let Err(err) = download_release(client, version, &staged_root) {
        let _ = fs::remove_dir_all(&staged_root);
        return Err(err);
    }

    if destination.exists() {
        fs::remove_dir_all(destination).with_context(|| {
            format!("failed to clear previous staging {}", destination.display())
        })?;
    }
    if let Err(err) = fs::rename(&staged_root, destination).with_context(|| {
        format!(
            "failed to move staged release into {}",
            destination.display()
        )
    }) {
        let _ = fs::remove_dir_all(&staged_root);
        return Err(err);
    }

    info!(
        version = %version,
        path = %destination.display(),
        "staged release from registry"
    );
    Ok(destination.to_path_buf())
}

fn download_release(client: &RegistryClient, version: &Version, staged_root: &Path) -> Result<()> {
    let listing = client.fetch_release_files(version)?;
    if listing.files.is_empty() {
        anyhow::bail!("registry release {version} lists no files");
    }

    fs::create_dir_all(staged_root)
        .with_context(|| format!("failed to create {}", staged_root.display()))?;

    for file in &listing.files {
        let relative = safe_relative_path(&file.path)?;
        let bytes = client.fetch_file(version, &file.path)?;
        if !verify_sha256(&bytes, &file.sha256) {
            anyhow::bail!(
                "checksum mismatch for release file '{}' (expected {})",
                file.path,
                file.sha256
            );
        }

        let target = staged_root.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, &bytes)
            .with_context(|| format!("failed to write staged file {}", target.display()))?;
        debug!(file = %file.path, bytes = bytes.len(), "downloaded release file");
    }

    Ok(())
}
