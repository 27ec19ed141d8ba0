//! End-to-end toolkit upgrades.
//!
//! [`UpgradeOrchestrator::upgrade`] is the single entry point: it detects a
//! version source, previews the change, asks for confirmation, backs up the
//! install, applies files and migrations, validates the result and rolls
//! back on failure.

mod detect;
mod options;
mod orchestrator;
mod plan;
mod state;

pub use detect::DetectedSource;
pub use options::{CancellationToken, Confirm, SourcePreference, UpgradeOptions};
pub use orchestrator::{UpgradeOrchestrator, UpgradeResult};
pub use plan::{render_plan_lines, UpgradePlan};
pub use state::{StateMachine, UpgradeState};

#[cfg(test)]
mod tests;
