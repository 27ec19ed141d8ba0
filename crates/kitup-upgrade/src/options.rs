use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kitup_resolver::TargetVersion;

use crate::UpgradePlan;

/// Which version source a run may use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourcePreference {
    /// Registry first, then the configured local source.
    #[default]
    Auto,
    Registry,
    /// A local install; `None` uses the configured one.
    Local(Option<PathBuf>),
}

impl FromStr for SourcePreference {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(Self::Auto),
            "registry" => Ok(Self::Registry),
            "local" => Ok(Self::Local(None)),
            other => match other.strip_prefix("local:") {
                Some(path) if !path.trim().is_empty() => {
                    Ok(Self::Local(Some(PathBuf::from(path.trim()))))
                }
                Some(_) => Err(anyhow!("local source path must not be empty")),
                None => Err(anyhow!(
                    "unknown source '{other}' (expected auto, registry, local or local:<path>)"
                )),
            },
        }
    }
}

impl fmt::Display for SourcePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Registry => f.write_str("registry"),
            Self::Local(None) => f.write_str("local"),
            Self::Local(Some(path)) => write!(f, "local:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub target: TargetVersion,
    pub source: SourcePreference,
    pub dry_run: bool,
    pub skip_confirmation: bool,
}

/// Shared flag a caller flips to stop a run at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Asks whether a previewed plan may be applied.
pub trait Confirm {
    fn confirm(&self, plan: &UpgradePlan) -> Result<bool>;
}

impl<F> Confirm for F
where
    F: Fn(&UpgradePlan) -> Result<bool>,
{
    fn confirm(&self, plan: &UpgradePlan) -> Result<bool> {
        self(plan)
    }
}
