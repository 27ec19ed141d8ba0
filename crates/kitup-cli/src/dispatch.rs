use anyhow::{Context, Result};
use kitup_core::{default_state_root, ToolkitLayout, UpgradeError, UpgradeSettings};
use kitup_installer::{BackupManager, ListedBackup, RestoreOptions, UpgradeLock};
use kitup_upgrade::{
    render_plan_lines, SourcePreference, UpgradeOptions, UpgradeOrchestrator, UpgradeResult,
};
use tracing::debug;

use crate::completion::write_completions_script;
use crate::prompt::StdinConfirm;
use crate::render::{current_output_style, TerminalRenderer};
use crate::{BackupCommands, Cli, Commands, UpgradeArgs};

/// Runs one command and returns the process exit code.
pub(crate) fn run_cli(cli: Cli) -> Result<i32> {
    let renderer = TerminalRenderer::from_style(current_output_style(cli.plain));

    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        write_completions_script(shell, &mut stdout)?;
        return Ok(0);
    }

    let layout = resolve_layout(&cli)?;
    let settings = UpgradeSettings::load(&layout.settings_path())?
        .apply_env(|key| std::env::var(key).ok());
    debug!(
        root = %layout.root().display(),
        install = %layout.install_dir().display(),
        "resolved toolkit layout"
    );

    match cli.command {
        Commands::Upgrade(args) => run_upgrade_command(renderer, layout, settings, args),
        Commands::Check { source } => run_check_command(renderer, layout, settings, &source),
        Commands::Backups { command } => {
            run_backups_command(renderer, &layout, &settings, command)
        }
        Commands::Completions { .. } => Ok(0),
    }
}

fn resolve_layout(cli: &Cli) -> Result<ToolkitLayout> {
    let root = match &cli.state_dir {
        Some(root) => root.clone(),
        None => default_state_root()?,
    };
    let layout = ToolkitLayout::new(root);
    Ok(match &cli.install_dir {
        Some(install_dir) => layout.with_install_dir(install_dir.clone()),
        None => layout,
    })
}

fn run_upgrade_command(
    renderer: TerminalRenderer,
    layout: ToolkitLayout,
    settings: UpgradeSettings,
    args: UpgradeArgs,
) -> Result<i32> {
    let prompts = !args.dry_run && !args.force;
    let mut orchestrator = UpgradeOrchestrator::new(layout, settings)?;
    if prompts {
        orchestrator = orchestrator.with_confirmer(StdinConfirm::new(renderer));
    }

    let options = UpgradeOptions {
        target: args.target_version,
        source: args.source,
        dry_run: args.dry_run,
        skip_confirmation: args.force,
    };
    let result = orchestrator.upgrade(&options);
    report_upgrade(renderer, &result, !prompts);
    Ok(result.exit_code())
}

fn report_upgrade(renderer: TerminalRenderer, result: &UpgradeResult, show_plan: bool) {
    if show_plan {
        if let Some(plan) = &result.plan {
            renderer.print_section("upgrade plan");
            renderer.print_plan_lines(&render_plan_lines(plan));
        }
    }

    for line in format_upgrade_outcome_lines(result) {
        match &result.error {
            None => renderer.print_status("ok", &line),
            Some(_) => renderer.print_error(&line),
        }
    }
}

/// Human summary of a finished run; one line per fact.
pub(crate) fn format_upgrade_outcome_lines(result: &UpgradeResult) -> Vec<String> {
    let from = result
        .from_version
        .as_ref()
        .map_or_else(|| "unknown".to_string(), ToString::to_string);
    let to = result
        .to_version
        .as_ref()
        .map_or_else(|| "unknown".to_string(), ToString::to_string);

    let Some(err) = &result.error else {
        if result.is_up_to_date() {
            return vec![format!("toolkit already at {from}; nothing to do")];
        }
        if result.plan.as_ref().is_some_and(|plan| plan.dry_run) {
            return vec![format!("dry run: {from} -> {to} planned, nothing changed")];
        }
        let mut lines = vec![format!("upgraded toolkit {from} -> {to}")];
        if let Some(backup_id) = &result.backup_id {
            lines.push(format!("backup={backup_id}"));
        }
        if !result.applied_migrations.is_empty() {
            let applied = result
                .applied_migrations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            lines.push(format!("migrations_applied={applied}"));
        }
        return lines;
    };

    let failed_in = result
        .failed_in
        .map_or_else(|| "unknown".to_string(), |state| state.to_string());
    let mut lines = vec![format!(
        "upgrade failed reason={} state={failed_in}: {err}",
        err.reason_code()
    )];
    if result.rolled_back {
        if let Some(backup_id) = &result.backup_id {
            lines.push(format!("install restored from backup {backup_id}"));
        }
    }
    if let UpgradeError::RollbackFailed { backup_id, .. } = err {
        lines.push(format!(
            "manual recovery required: run `kitup backups restore {backup_id}`"
        ));
    }
    lines
}

fn run_check_command(
    renderer: TerminalRenderer,
    layout: ToolkitLayout,
    settings: UpgradeSettings,
    source: &SourcePreference,
) -> Result<i32> {
    let orchestrator = UpgradeOrchestrator::new(layout, settings)?;
    let spinner = renderer.start_spinner("check");
    match orchestrator.check_for_updates(source) {
        Ok((source, check)) => {
            spinner.finish();
            renderer.print_lines(&[format!(
                "check current={} latest={} bump={} update={} source={source}",
                check.info.current(),
                check.info.latest(),
                check.bump,
                if check.has_update { "yes" } else { "no" },
            )]);
            Ok(0)
        }
        Err(err) => {
            spinner.abandon();
            Ok(report_failure(renderer, &err))
        }
    }
}

fn run_backups_command(
    renderer: TerminalRenderer,
    layout: &ToolkitLayout,
    settings: &UpgradeSettings,
    command: BackupCommands,
) -> Result<i32> {
    let manager = BackupManager::from_settings(layout, settings)?;
    match command {
        BackupCommands::List => {
            let backups = manager.list_backups()?;
            if backups.is_empty() {
                renderer.print_status("info", "no backups");
            }
            for backup in &backups {
                renderer.print_lines(&format_backup_lines(backup));
            }
            Ok(0)
        }
        BackupCommands::Restore {
            backup_id,
            preserve_regenerable,
        } => {
            layout.ensure_base_dirs()?;
            let _lock = match UpgradeLock::acquire(&layout.lock_path()) {
                Ok(lock) => lock,
                Err(err) => return Ok(report_failure(renderer, &err)),
            };
            let path = manager.find_backup(&backup_id)?;
            let options = RestoreOptions {
                preserve_regenerable,
            };
            match manager.restore_backup(&path, layout.install_dir(), options) {
                Ok(outcome) => {
                    renderer.print_status(
                        "ok",
                        &format!(
                            "restored backup {} files={} preserved={}",
                            outcome.backup_id,
                            outcome.restored_files,
                            outcome.preserved_paths.len()
                        ),
                    );
                    Ok(0)
                }
                Err(err) => Ok(report_failure(renderer, &err)),
            }
        }
        BackupCommands::Prune { keep } => {
            let keep = match keep {
                Some(keep) => usize::try_from(keep).context("--keep is too large")?,
                None => settings.keep_backups,
            };
            let removed = manager.prune_backups(keep)?;
            for backup_id in &removed {
                renderer.print_lines(&[format!("pruned backup={backup_id}")]);
            }
            renderer.print_status(
                "ok",
                &format!("kept {keep} newest backups, removed {}", removed.len()),
            );
            Ok(0)
        }
        BackupCommands::Remove { backup_id } => {
            manager.remove_backup(&backup_id)?;
            renderer.print_status("ok", &format!("removed backup {backup_id}"));
            Ok(0)
        }
    }
}

pub(crate) fn format_backup_lines(backup: &ListedBackup) -> Vec<String> {
    let status = if backup.is_valid() { "valid" } else { "invalid" };
    let mut lines = vec![match &backup.metadata {
        Some(metadata) => format!(
            "backup id={} version={} created_at_unix_ms={} files={} status={status}",
            backup.id, metadata.source_version, metadata.created_at_unix_ms, metadata.file_count
        ),
        None => format!("backup id={} status={status}", backup.id),
    }];
    for problem in &backup.validation.problems {
        lines.push(format!("  problem: {problem}"));
    }
    lines
}

fn report_failure(renderer: TerminalRenderer, err: &UpgradeError) -> i32 {
    renderer.print_error(&format!("{err} ({})", err.reason_code()));
    err.exit_code()
}
