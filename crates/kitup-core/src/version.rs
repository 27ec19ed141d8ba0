use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
    None,
}

impl BumpKind {
    pub fn between(current: &Version, latest: &Version) -> Self {
        if latest <= current {
            return Self::None;
        }
        if latest.major != current.major {
            Self::Major
        } else if latest.minor != current.minor {
            Self::Minor
        } else {
            Self::Patch
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and available versions for one run. Built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    current: Version,
    latest: Version,
    bump: BumpKind,
}

impl VersionInfo {
    pub fn new(current: Version, latest: Version) -> Self {
        let bump = BumpKind::between(&current, &latest);
        Self {
            current,
            latest,
            bump,
        }
    }

    pub fn current(&self) -> &Version {
        &self.current
    }

    pub fn latest(&self) -> &Version {
        &self.latest
    }

    pub fn bump(&self) -> BumpKind {
        self.bump
    }

    pub fn has_update(&self) -> bool {
        self.bump != BumpKind::None
    }
}
