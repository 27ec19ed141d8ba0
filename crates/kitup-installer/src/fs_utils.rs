use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use kitup_core::is_noise_file;
use kitup_security::normalize_relative_path;

/// Recursively copies `src` to `dst`, reproducing symlinks instead of
/// following them. Returns the number of non-directory entries written.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    copy_tree_filtered(src, dst, &|_| false)
}

/// Like [`copy_tree`], but entries whose path relative to `src` satisfies
/// `skip` are left behind. Skipped directories are not descended into.
pub fn copy_tree_filtered(src: &Path, dst: &Path, skip: &dyn Fn(&str) -> bool) -> Result<u64> {
    copy_entry(src, src, dst, skip)
}

fn copy_entry(root: &Path, src: &Path, dst: &Path, skip: &dyn Fn(&str) -> bool) -> Result<u64> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat source path: {}", src.display()))?;

    if metadata.is_dir() {
        fs::create_dir_all(dst)
            .with_context(|| format!("failed to create directory: {}", dst.display()))?;
        let mut copied = 0;
        for entry in
            fs::read_dir(src).with_context(|| format!("failed to read directory: {}", src.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", src.display()))?;
            let child_src = entry.path();
            let relative = relative_key(root, &child_src)?;
            if skip(&relative) {
                continue;
            }
            copied += copy_entry(root, &child_src, &dst.join(entry.file_name()), skip)?;
        }
        return Ok(copied);
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink: {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to copy symlink {} -> {}",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(1);
    }

    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(1)
}

/// Relative, `/`-separated paths of every non-directory entry under `root`,
/// sorted. OS noise files and anything `skip` accepts are left out.
pub fn list_tree_files(root: &Path, skip: &dyn Fn(&str) -> bool) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed to read directory: {}", dir.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to iterate directory: {}", dir.display()))?;
            let path = entry.path();
            let relative = relative_key(root, &path)?;
            if skip(&relative) {
                continue;
            }
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if !is_noise_file(&entry.file_name().to_string_lossy()) {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory: {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove file: {}", path.display()))
    }
}

/// Removes empty directories from `start` upwards, stopping at `root` or at
/// the first directory that still exists under `mirror`.
pub fn prune_empty_parents(root: &Path, start: &Path, mirror: &Path) {
    let mut current = start.parent();
    while let Some(dir) = current {
        let Ok(relative) = dir.strip_prefix(root) else {
            break;
        };
        if relative.as_os_str().is_empty() || mirror.join(relative).is_dir() {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

pub fn unix_millis() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_millis())
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(normalize_relative_path(relative))
}
