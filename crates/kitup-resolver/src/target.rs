use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use semver::{Version, VersionReq};

/// What `--target-version` asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetVersion {
    #[default]
    Latest,
    Exact(Version),
    Matching(VersionReq),
}

impl FromStr for TargetVersion {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("target version must not be empty"));
        }
        if value.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        if let Ok(version) = Version::parse(value.trim_start_matches('v')) {
            return Ok(Self::Exact(version));
        }
        let requirement = VersionReq::parse(value)
            .with_context(|| format!("invalid target version '{value}'"))?;
        Ok(Self::Matching(requirement))
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(version) => write!(f, "{version}"),
            Self::Matching(requirement) => write!(f, "{requirement}"),
        }
    }
}

impl TargetVersion {
    /// Picks the version this request names out of what a source offers.
    pub fn select<'a>(&self, latest: &'a Version, available: &'a [Version]) -> Option<&'a Version> {
        match self {
            Self::Latest => Some(latest),
            Self::Exact(version) => {
                if latest == version {
                    Some(latest)
                } else {
                    available.iter().find(|candidate| *candidate == version)
                }
            }
            Self::Matching(requirement) => {
                select_highest_matching(available.iter().chain(std::iter::once(latest)), requirement)
            }
        }
    }
}

pub fn select_highest_matching<'a, I>(candidates: I, requirement: &VersionReq) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    candidates
        .into_iter()
        .filter(|version| requirement.matches(version))
        .max()
}
