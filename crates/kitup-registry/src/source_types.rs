use std::fmt;
use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Where a target version and its files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSource {
    RemoteRegistry { url: String },
    LocalDirectory(PathBuf),
}

impl VersionSource {
    pub fn label(&self) -> String {
        match self {
            Self::RemoteRegistry { url } => format!("registry:{url}"),
            Self::LocalDirectory(path) => format!("local:{}", path.display()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteRegistry { .. })
    }
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// `<registry>/index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIndex {
    pub name: String,
    pub latest: Version,
    #[serde(default)]
    pub releases: Vec<Version>,
}

impl ReleaseIndex {
    pub fn contains(&self, version: &Version) -> bool {
        &self.latest == version || self.releases.contains(version)
    }
}

/// `<registry>/releases/<version>/files.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFiles {
    pub version: Version,
    pub files: Vec<ReleaseFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub path: String,
    pub sha256: String,
}
