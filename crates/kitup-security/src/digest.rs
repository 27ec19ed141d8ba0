use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::sha256_hex;

/// Content fingerprint of a directory tree: relative path -> file sha256,
/// plus one digest over the sorted listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub files: BTreeMap<String, String>,
    pub digest: String,
}

impl TreeDigest {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Hashes every regular file below `root`. `skip` receives the normalized
/// relative path and prunes whole subtrees when it returns true for a
/// directory.
pub fn tree_digest<F>(root: &Path, skip: F) -> Result<TreeDigest>
where
    F: Fn(&str) -> bool,
{
    let mut files = BTreeMap::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed reading directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let relative = path.strip_prefix(root).with_context(|| {
                format!(
                    "failed deriving relative path {} from {}",
                    path.display(),
                    root.display()
                )
            })?;
            let relative = normalize_relative_path(relative);
            if skip(&relative) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                queue.push_back(path);
            } else if file_type.is_file() {
                let bytes = fs::read(&path)
                    .with_context(|| format!("failed reading file {}", path.display()))?;
                files.insert(relative, sha256_hex(&bytes));
            }
        }
    }

    let mut listing = Vec::new();
    for (path, file_digest) in &files {
        listing.extend_from_slice(path.as_bytes());
        listing.push(0);
        listing.extend_from_slice(file_digest.as_bytes());
        listing.push(0);
    }

    Ok(TreeDigest {
        digest: sha256_hex(&listing),
        files,
    })
}

pub fn normalize_relative_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
