use std::fmt;
use std::path::PathBuf;

use semver::Version;
use thiserror::Error;

/// One source the orchestrator tried while auto-detecting, and why it was
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for SourceAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.reason)
    }
}

/// A field both the user and the new release changed to different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigConflict {
    pub key_path: String,
    pub user: Option<String>,
    pub incoming: Option<String>,
    pub reason: String,
}

impl fmt::Display for ConfigConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: user={} incoming={} ({})",
            self.key_path,
            self.user.as_deref().unwrap_or("<removed>"),
            self.incoming.as_deref().unwrap_or("<removed>"),
            self.reason
        )
    }
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("toolkit manifest missing or unreadable at {}: {reason}", path.display())]
    ManifestMissing { path: PathBuf, reason: String },

    #[error("version source {label} is unavailable: {reason}")]
    SourceUnavailable { label: String, reason: String },

    #[error("version source {label} is not a valid toolkit install: {reason}")]
    SourceInvalid { label: String, reason: String },

    #[error("no usable version source; tried {}", join_display(attempts))]
    NoUsableSource { attempts: Vec<SourceAttempt> },

    #[error("file '{path}' is not classified by any upgrade strategy rule")]
    Unclassified { path: String },

    #[error("file '{path}' matches more than one upgrade strategy rule: {}", rules.join(", "))]
    AmbiguousStrategy { path: String, rules: Vec<String> },

    #[error("another upgrade holds the lock (pid={pid} path={})", lock_path.display())]
    Locked { pid: u32, lock_path: PathBuf },

    #[error("upgrade declined at confirmation")]
    Declined,

    #[error("upgrade cancelled while {state}")]
    Cancelled { state: String },

    #[error("target version {target} is older than installed version {current}")]
    Downgrade { current: Version, target: Version },

    #[error("backup failed: {reason}")]
    BackupFailed { reason: String },

    #[error("backup {backup_id} failed validation: {}", problems.join("; "))]
    BackupValidationFailed {
        backup_id: String,
        problems: Vec<String>,
    },

    #[error("merge conflict in {path}: {}", join_display(conflicts))]
    MergeConflict {
        path: String,
        conflicts: Vec<ConfigConflict>,
    },

    #[error("migration {version} failed after {} applied: {reason}", applied.len())]
    MigrationFailed {
        version: Version,
        applied: Vec<Version>,
        reason: String,
    },

    #[error("upgraded install failed validation: {}", problems.join("; "))]
    ValidationFailed { problems: Vec<String> },

    #[error(
        "rollback failed; restore manually from backup {backup_id} at {}: {reason}",
        backup_path.display()
    )]
    RollbackFailed {
        backup_id: String,
        backup_path: PathBuf,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpgradeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SourceUnavailable { .. }
            | Self::SourceInvalid { .. }
            | Self::NoUsableSource { .. } => 2,
            Self::BackupValidationFailed { .. } => 3,
            Self::RollbackFailed { .. } => 4,
            _ => 1,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ManifestMissing { .. } => "manifest_missing",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::SourceInvalid { .. } => "source_invalid",
            Self::NoUsableSource { .. } => "no_usable_source",
            Self::Unclassified { .. } => "unclassified_file",
            Self::AmbiguousStrategy { .. } => "ambiguous_strategy",
            Self::Locked { .. } => "locked",
            Self::Declined => "declined",
            Self::Cancelled { .. } => "cancelled",
            Self::Downgrade { .. } => "downgrade",
            Self::BackupFailed { .. } => "backup_failed",
            Self::BackupValidationFailed { .. } => "backup_invalid",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::MigrationFailed { .. } => "migration_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::Other(_) => "error",
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
