use std::fs;
use std::path::PathBuf;

use kitup_core::{
    ToolkitLayout, ToolkitManifest, UpgradeError, UpgradeSettings, CRITICAL_PATHS,
    MIGRATIONS_FILE,
};
use kitup_installer::{
    remove_path_if_exists, run_migrations, Backup, BackupManager, FileMerger, MigrationCatalog,
    MigrationContext, MigrationRegistry, PathExclusions, RestoreOptions, StrategyTable,
    UpgradeLock,
};
use kitup_resolver::VersionResolver;
use semver::Version;
use tracing::{error, info, warn};

use crate::detect::DetectedSource;
use crate::{CancellationToken, Confirm, StateMachine, UpgradeOptions, UpgradePlan, UpgradeState};

/// Outcome of one [`UpgradeOrchestrator::upgrade`] call.
#[derive(Debug)]
pub struct UpgradeResult {
    pub succeeded: bool,
    pub final_state: UpgradeState,
    /// State the run was in when it failed.
    pub failed_in: Option<UpgradeState>,
    pub states: Vec<UpgradeState>,
    pub from_version: Option<Version>,
    pub to_version: Option<Version>,
    pub plan: Option<UpgradePlan>,
    pub applied_migrations: Vec<Version>,
    pub backup_id: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub rolled_back: bool,
    pub error: Option<UpgradeError>,
}

impl UpgradeResult {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, UpgradeError::exit_code)
    }

    /// Succeeded without a plan because the install already has the target.
    pub fn is_up_to_date(&self) -> bool {
        self.succeeded && self.final_state == UpgradeState::Stopped && self.plan.is_none()
    }
}

#[derive(Default)]
struct Run {
    machine: StateMachine,
    failed_in: Option<UpgradeState>,
    from_version: Option<Version>,
    to_version: Option<Version>,
    plan: Option<UpgradePlan>,
    backup: Option<Backup>,
    applied: Vec<Version>,
    staged_dir: Option<PathBuf>,
    rolled_back: bool,
}

impl Run {
    fn finish(mut self, outcome: Result<(), UpgradeError>) -> UpgradeResult {
        let error = match outcome {
            Ok(()) => None,
            Err(err) => {
                let current = self.machine.current();
                self.failed_in.get_or_insert(current);
                if !current.is_terminal() {
                    if let Err(transition) = self.machine.advance(UpgradeState::Aborted) {
                        warn!(error = %transition, "could not record aborted state");
                    }
                }
                Some(err)
            }
        };

        let final_state = self.machine.current();
        match &error {
            None => info!(state = %final_state, "upgrade finished"),
            Some(err) => error!(
                state = %final_state,
                failed_in = ?self.failed_in,
                reason = err.reason_code(),
                error = %err,
                "upgrade failed"
            ),
        }

        UpgradeResult {
            succeeded: error.is_none(),
            final_state,
            failed_in: self.failed_in,
            states: self.machine.history().to_vec(),
            from_version: self.from_version,
            to_version: self.to_version,
            plan: self.plan,
            applied_migrations: self.applied,
            backup_id: self.backup.as_ref().map(|backup| backup.id().to_string()),
            backup_path: self.backup.map(|backup| backup.path),
            rolled_back: self.rolled_back,
            error,
        }
    }
}

/// Drives detect, preview, confirm, backup, apply, validate and rollback for
/// one install.
pub struct UpgradeOrchestrator {
    pub(crate) layout: ToolkitLayout,
    pub(crate) settings: UpgradeSettings,
    pub(crate) resolver: VersionResolver,
    backups: BackupManager,
    merger: FileMerger,
    catalog: MigrationCatalog,
    confirmer: Option<Box<dyn Confirm>>,
    cancellation: CancellationToken,
}

impl UpgradeOrchestrator {
    pub fn new(layout: ToolkitLayout, settings: UpgradeSettings) -> anyhow::Result<Self> {
        let exclusions = PathExclusions::new(&settings.backup_exclusions)?;
        Ok(Self {
            resolver: VersionResolver::from_settings(&layout, &settings),
            backups: BackupManager::from_settings(&layout, &settings)?,
            merger: FileMerger::new(StrategyTable::builtin()?, exclusions),
            catalog: MigrationCatalog::builtin(),
            confirmer: None,
            cancellation: CancellationToken::new(),
            layout,
            settings,
        })
    }

    pub fn with_catalog(mut self, catalog: MigrationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_strategy_table(mut self, table: StrategyTable) -> anyhow::Result<Self> {
        let exclusions = PathExclusions::new(&self.settings.backup_exclusions)?;
        self.merger = FileMerger::new(table, exclusions);
        Ok(self)
    }

    /// Without a confirmer every run that does not skip confirmation is
    /// declined.
    pub fn with_confirmer(mut self, confirmer: impl Confirm + 'static) -> Self {
        self.confirmer = Some(Box::new(confirmer));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn layout(&self) -> &ToolkitLayout {
        &self.layout
    }

    pub fn settings(&self) -> &UpgradeSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Runs the whole pipeline. Failures before the backup leave the install
    /// untouched; later failures restore the backup before returning.
    pub fn upgrade(&self, options: &UpgradeOptions) -> UpgradeResult {
        info!(
            target = %options.target,
            source = %options.source,
            dry_run = options.dry_run,
            install = %self.layout.install_dir().display(),
            "starting upgrade"
        );
        let mut run = Run::default();
        let outcome = self.drive(options, &mut run);
        if let Some(staged) = run.staged_dir.take() {
            if let Err(err) = remove_path_if_exists(&staged) {
                warn!(path = %staged.display(), error = %format!("{err:#}"), "failed to clean staged release");
            }
        }
        run.finish(outcome)
    }

    fn drive(&self, options: &UpgradeOptions, run: &mut Run) -> Result<(), UpgradeError> {
        run.machine.advance(UpgradeState::DetectingSource)?;
        self.layout.ensure_base_dirs()?;
        let _lock = UpgradeLock::acquire(&self.layout.lock_path())?;

        let current = self.resolver.current_manifest()?;
        run.from_version = Some(current.version.clone());
        self.check_cancelled(run)?;

        let detected = self.detect_source(&options.source, &options.target)?;
        if detected.staged {
            run.staged_dir = Some(detected.files_dir.clone());
        }
        run.to_version = Some(detected.target.clone());

        if detected.target < current.version {
            return Err(UpgradeError::Downgrade {
                current: current.version,
                target: detected.target,
            });
        }
        if detected.target == current.version {
            info!(version = %current.version, "install already at target version");
            run.machine.advance(UpgradeState::Stopped)?;
            return Ok(());
        }

        run.machine.advance(UpgradeState::Previewing)?;
        let plan = self.build_plan(&current.version, &detected, options.dry_run)?;
        run.plan = Some(plan.clone());
        if options.dry_run {
            run.machine.advance(UpgradeState::Stopped)?;
            return Ok(());
        }
        self.check_cancelled(run)?;

        run.machine.advance(UpgradeState::AwaitingConfirmation)?;
        if !options.skip_confirmation {
            let approved = match &self.confirmer {
                Some(confirmer) => confirmer.confirm(&plan)?,
                None => false,
            };
            if !approved {
                return Err(UpgradeError::Declined);
            }
        }
        self.check_cancelled(run)?;

        run.machine.advance(UpgradeState::BackingUp)?;
        let install_dir = self.layout.install_dir();
        let backup = self
            .backups
            .create_backup(install_dir)
            .map_err(|err| UpgradeError::BackupFailed {
                reason: format!("{err:#}"),
            })?;
        run.backup = Some(backup.clone());
        let validation = self.backups.validate_backup(&backup.path)?;
        if !validation.is_valid() {
            return Err(UpgradeError::BackupValidationFailed {
                backup_id: backup.id().to_string(),
                problems: validation.problems,
            });
        }

        if let Err(err) = self.apply(&plan, run) {
            return Err(self.roll_back(run, err));
        }
        run.machine.advance(UpgradeState::Complete)?;
        info!(
            from = %plan.from_version,
            to = %plan.to_version,
            backup_id = %backup.id(),
            migrations = run.applied.len(),
            "upgrade complete"
        );
        Ok(())
    }

    fn build_plan(
        &self,
        current: &Version,
        detected: &DetectedSource,
        dry_run: bool,
    ) -> Result<UpgradePlan, UpgradeError> {
        let files = self
            .merger
            .plan_files(self.layout.install_dir(), &detected.files_dir)?;
        let registry = MigrationRegistry::load(
            &detected.files_dir.join(MIGRATIONS_FILE),
            &self.catalog,
        )?;
        let applicable_migrations = registry.get_applicable_migrations(current, &detected.target);

        Ok(UpgradePlan {
            from_version: current.clone(),
            to_version: detected.target.clone(),
            source: detected.source.clone(),
            incoming_dir: detected.files_dir.clone(),
            files,
            applicable_migrations,
            dry_run,
        })
    }

    fn apply(&self, plan: &UpgradePlan, run: &mut Run) -> Result<(), UpgradeError> {
        self.check_cancelled(run)?;
        run.machine.advance(UpgradeState::Merging)?;
        self.merger.apply_upgrade(&plan.files)?;

        self.check_cancelled(run)?;
        run.machine.advance(UpgradeState::Migrating)?;
        let context = MigrationContext {
            install_dir: self.layout.install_dir(),
            from_version: &plan.from_version,
            to_version: &plan.to_version,
        };
        match run_migrations(&plan.applicable_migrations, &context) {
            Ok(applied) => run.applied = applied,
            Err(err) => {
                if let UpgradeError::MigrationFailed { applied, .. } = &err {
                    run.applied = applied.clone();
                }
                return Err(err);
            }
        }

        self.check_cancelled(run)?;
        run.machine.advance(UpgradeState::Validating)?;
        self.validate_install(&plan.to_version)
    }

    /// Restores the backup taken for this run. A failed restore is reported
    /// once with the backup location; it is never retried.
    fn roll_back(&self, run: &mut Run, cause: UpgradeError) -> UpgradeError {
        let failed_in = run.machine.current();
        run.failed_in = Some(failed_in);
        let Some(backup) = run.backup.clone() else {
            return cause;
        };
        error!(state = %failed_in, backup_id = %backup.id(), error = %cause, "upgrade step failed; rolling back");
        if let Err(err) = run.machine.advance(UpgradeState::RollingBack) {
            return err;
        }

        let restored = self.backups.restore_backup(
            &backup.path,
            self.layout.install_dir(),
            RestoreOptions {
                preserve_regenerable: true,
            },
        );
        match restored {
            Ok(outcome) => {
                run.rolled_back = true;
                if let Err(err) = run.machine.advance(UpgradeState::RolledBack) {
                    warn!(error = %err, "could not record rolled back state");
                }
                warn!(backup_id = %outcome.backup_id, files = outcome.restored_files, "rolled back to pre-upgrade snapshot");
                cause
            }
            Err(err) => {
                if let Err(transition) = run.machine.advance(UpgradeState::Fatal) {
                    warn!(error = %transition, "could not record fatal state");
                }
                error!(
                    backup_id = %backup.id(),
                    backup_path = %backup.path.display(),
                    error = %err,
                    "rollback failed; manual recovery required"
                );
                UpgradeError::RollbackFailed {
                    backup_id: backup.id().to_string(),
                    backup_path: backup.path.clone(),
                    reason: format!("{err} (while recovering from: {cause})"),
                }
            }
        }
    }

    fn validate_install(&self, target: &Version) -> Result<(), UpgradeError> {
        let install_dir = self.layout.install_dir();
        let mut problems = Vec::new();
        match ToolkitManifest::read_from_dir(install_dir) {
            Ok(manifest) => {
                if &manifest.version != target {
                    problems.push(format!(
                        "manifest version {} does not match target {target}",
                        manifest.version
                    ));
                }
                if manifest.name != self.resolver.toolkit_name() {
                    problems.push(format!(
                        "manifest name '{}' does not match '{}'",
                        manifest.name,
                        self.resolver.toolkit_name()
                    ));
                }
            }
            Err(err) => problems.push(format!("{err:#}")),
        }
        for critical in CRITICAL_PATHS {
            if fs::symlink_metadata(install_dir.join(critical)).is_err() {
                problems.push(format!("critical path {critical} is missing"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(UpgradeError::ValidationFailed { problems })
        }
    }

    fn check_cancelled(&self, run: &Run) -> Result<(), UpgradeError> {
        if self.cancellation.is_cancelled() {
            return Err(UpgradeError::Cancelled {
                state: run.machine.current().to_string(),
            });
        }
        Ok(())
    }
}
