use std::fmt;

use anyhow::anyhow;
use kitup_core::UpgradeError;
use tracing::debug;

/// Where one upgrade run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Idle,
    DetectingSource,
    Previewing,
    /// Dry run finished, or nothing to upgrade.
    Stopped,
    AwaitingConfirmation,
    BackingUp,
    Merging,
    Migrating,
    Validating,
    Complete,
    /// Failed before anything in the install was touched.
    Aborted,
    RollingBack,
    RolledBack,
    /// Rollback failed; the install needs manual recovery.
    Fatal,
}

impl UpgradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DetectingSource => "detecting_source",
            Self::Previewing => "previewing",
            Self::Stopped => "stopped",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::BackingUp => "backing_up",
            Self::Merging => "merging",
            Self::Migrating => "migrating",
            Self::Validating => "validating",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Fatal => "fatal",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Complete | Self::Aborted | Self::RolledBack | Self::Fatal
        )
    }

    /// States in which the install may already differ from the backup.
    pub fn requires_rollback(self) -> bool {
        matches!(self, Self::Merging | Self::Migrating | Self::Validating)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use UpgradeState::*;
        matches!(
            (self, next),
            (Idle, DetectingSource)
                | (DetectingSource, Previewing | Stopped | Aborted)
                | (Previewing, Stopped | AwaitingConfirmation | Aborted)
                | (AwaitingConfirmation, BackingUp | Aborted)
                | (BackingUp, Merging | Aborted | RollingBack)
                | (Merging, Migrating | RollingBack)
                | (Migrating, Validating | RollingBack)
                | (Validating, Complete | RollingBack)
                | (RollingBack, RolledBack | Fatal)
        )
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    current: UpgradeState,
    history: Vec<UpgradeState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: UpgradeState::Idle,
            history: vec![UpgradeState::Idle],
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> UpgradeState {
        self.current
    }

    pub fn history(&self) -> &[UpgradeState] {
        &self.history
    }

    pub fn advance(&mut self, next: UpgradeState) -> Result<(), UpgradeError> {
        if !self.current.can_transition_to(next) {
            return Err(anyhow!(
                "illegal upgrade state transition {} -> {}",
                self.current,
                next
            )
            .into());
        }
        debug!(from = %self.current, to = %next, "upgrade state transition");
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}
