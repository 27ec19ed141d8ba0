use std::io::Cursor;
use std::path::PathBuf;

use clap::Parser;
use kitup_core::UpgradeError;
use kitup_installer::{BackupMetadata, BackupValidation, ListedBackup};
use kitup_resolver::TargetVersion;
use kitup_upgrade::{SourcePreference, UpgradeResult, UpgradeState};
use semver::{Version, VersionReq};
use tracing::level_filters::LevelFilter;

use crate::completion::write_completions_script;
use crate::dispatch::{format_backup_lines, format_upgrade_outcome_lines};
use crate::prompt::prompt_yes_no;
use crate::render::{render_status_line, resolve_output_style, OutputStyle};
use crate::{log_level_for, BackupCommands, Cli, CliCompletionShell, Commands};

#[test]
fn upgrade_defaults_to_auto_source_and_latest_target() {
    let cli = Cli::try_parse_from(["kitup", "upgrade"]).expect("command must parse");

    match cli.command {
        Commands::Upgrade(args) => {
            assert!(!args.dry_run);
            assert!(!args.force);
            assert_eq!(args.source, SourcePreference::Auto);
            assert_eq!(args.target_version, TargetVersion::Latest);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn upgrade_accepts_every_documented_flag() {
    let cli = Cli::try_parse_from([
        "kitup",
        "upgrade",
        "--dry-run",
        "--force",
        "--source=local:/opt/kit",
        "--target-version=1.4.0",
    ])
    .expect("command must parse");

    match cli.command {
        Commands::Upgrade(args) => {
            assert!(args.dry_run);
            assert!(args.force);
            assert_eq!(
                args.source,
                SourcePreference::Local(Some(PathBuf::from("/opt/kit")))
            );
            assert_eq!(
                args.target_version,
                TargetVersion::Exact(Version::new(1, 4, 0))
            );
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn upgrade_accepts_version_requirement_target() {
    let cli = Cli::try_parse_from(["kitup", "upgrade", "--target-version", "^1.2"])
        .expect("command must parse");

    match cli.command {
        Commands::Upgrade(args) => assert_eq!(
            args.target_version,
            TargetVersion::Matching(VersionReq::parse("^1.2").expect("requirement"))
        ),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn upgrade_rejects_unknown_source() {
    let err = Cli::try_parse_from(["kitup", "upgrade", "--source", "ftp"])
        .expect_err("unknown source must fail");
    assert!(err.to_string().contains("unknown source 'ftp'"));
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "kitup",
        "check",
        "--state-dir",
        "/tmp/kitup-state",
        "--install-dir",
        "/tmp/kit",
        "-vv",
        "--plain",
    ])
    .expect("command must parse");

    assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/kitup-state")));
    assert_eq!(cli.install_dir, Some(PathBuf::from("/tmp/kit")));
    assert_eq!(cli.verbose, 2);
    assert!(cli.plain);
    assert!(matches!(
        cli.command,
        Commands::Check {
            source: SourcePreference::Auto
        }
    ));
}

#[test]
fn backups_subcommands_parse() {
    let cli = Cli::try_parse_from(["kitup", "backups", "restore", "backup-1", "--preserve-regenerable"])
        .expect("restore must parse");
    match cli.command {
        Commands::Backups {
            command:
                BackupCommands::Restore {
                    backup_id,
                    preserve_regenerable,
                },
        } => {
            assert_eq!(backup_id, "backup-1");
            assert!(preserve_regenerable);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["kitup", "backups", "prune", "--keep", "2"])
        .expect("prune must parse");
    assert!(matches!(
        cli.command,
        Commands::Backups {
            command: BackupCommands::Prune { keep: Some(2) }
        }
    ));

    Cli::try_parse_from(["kitup", "backups", "prune", "--keep", "0"])
        .expect_err("keeping zero backups must be rejected");
}

#[test]
fn verbosity_maps_to_log_level() {
    assert_eq!(log_level_for(0), LevelFilter::WARN);
    assert_eq!(log_level_for(1), LevelFilter::DEBUG);
    assert_eq!(log_level_for(5), LevelFilter::TRACE);
}

#[test]
fn output_style_falls_back_to_plain() {
    assert_eq!(resolve_output_style(false, false, true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, false, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, true, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false, false), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "upgraded toolkit 1.0.0 -> 1.2.0"),
        "upgraded toolkit 1.0.0 -> 1.2.0"
    );
}

#[test]
fn render_status_line_rich_uses_uncoloured_badge_for_unknown_status() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "info", "no backups"),
        "[INFO] no backups"
    );
    let warn = render_status_line(OutputStyle::Rich, "warn", "lock reclaimed");
    assert!(warn.contains("[WARN]"));
    assert!(warn.ends_with(" lock reclaimed"));
}

#[test]
fn prompt_accepts_only_explicit_yes() {
    for (answer, expected) in [
        ("y\n", true),
        ("YES\n", true),
        ("\n", false),
        ("no\n", false),
        ("", false),
    ] {
        let mut input = Cursor::new(answer.as_bytes().to_vec());
        let mut output = Vec::new();
        let approved =
            prompt_yes_no(&mut input, &mut output, "Upgrade?").expect("prompt must succeed");
        assert_eq!(approved, expected, "answer {answer:?}");
        assert_eq!(String::from_utf8(output).expect("utf8"), "Upgrade? [y/N] ");
    }
}

#[test]
fn completion_script_names_the_binary() {
    let mut script = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut script)
        .expect("bash completions must render");
    let script = String::from_utf8(script).expect("utf8");
    assert!(script.contains("kitup"));
    assert!(script.contains("upgrade"));
}

#[test]
fn outcome_lines_for_successful_upgrade() {
    let mut result = sample_result();
    result.final_state = UpgradeState::Complete;
    result.backup_id = Some("backup-1700000000000".to_string());
    result.applied_migrations = vec![Version::new(1, 1, 0), Version::new(1, 2, 0)];

    assert_eq!(
        format_upgrade_outcome_lines(&result),
        vec![
            "upgraded toolkit 1.0.0 -> 1.2.0".to_string(),
            "backup=backup-1700000000000".to_string(),
            "migrations_applied=1.1.0,1.2.0".to_string(),
        ]
    );
}

#[test]
fn outcome_lines_for_up_to_date_install() {
    let mut result = sample_result();
    result.final_state = UpgradeState::Stopped;
    result.to_version = Some(Version::new(1, 0, 0));

    assert_eq!(
        format_upgrade_outcome_lines(&result),
        vec!["toolkit already at 1.0.0; nothing to do".to_string()]
    );
}

#[test]
fn outcome_lines_point_at_backup_when_rollback_fails() {
    let mut result = sample_result();
    result.succeeded = false;
    result.final_state = UpgradeState::Fatal;
    result.failed_in = Some(UpgradeState::RollingBack);
    result.backup_id = Some("backup-7".to_string());
    result.error = Some(UpgradeError::RollbackFailed {
        backup_id: "backup-7".to_string(),
        backup_path: PathBuf::from("/state/backups/backup-7"),
        reason: "disk full".to_string(),
    });

    let lines = format_upgrade_outcome_lines(&result);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("upgrade failed reason=rollback_failed state=rolling_back:"));
    assert_eq!(
        lines[1],
        "manual recovery required: run `kitup backups restore backup-7`"
    );
    assert_eq!(result.exit_code(), 4);
}

#[test]
fn outcome_lines_report_restored_backup() {
    let mut result = sample_result();
    result.succeeded = false;
    result.final_state = UpgradeState::RolledBack;
    result.failed_in = Some(UpgradeState::Migrating);
    result.backup_id = Some("backup-9".to_string());
    result.rolled_back = true;
    result.error = Some(UpgradeError::MigrationFailed {
        version: Version::new(1, 2, 0),
        applied: vec![Version::new(1, 1, 0)],
        reason: "boom".to_string(),
    });

    let lines = format_upgrade_outcome_lines(&result);
    assert!(lines[0].contains("reason=migration_failed state=migrating"));
    assert_eq!(lines[1], "install restored from backup backup-9");
    assert_eq!(result.exit_code(), 1);
}

#[test]
fn backup_lines_include_validation_problems() {
    let metadata = BackupMetadata {
        id: "backup-2".to_string(),
        source_version: Version::new(1, 0, 0),
        created_at_unix_ms: 1_700_000_000_000,
        file_count: 6,
        excluded_patterns: vec!["cache/**".to_string()],
    };
    let listed = ListedBackup {
        id: "backup-2".to_string(),
        path: PathBuf::from("/state/backups/backup-2"),
        metadata: Some(metadata.clone()),
        validation: BackupValidation {
            path: PathBuf::from("/state/backups/backup-2"),
            metadata: Some(metadata),
            observed_file_count: Some(4),
            tolerance_percent: 0.0,
            missing_critical: vec!["docs".to_string()],
            problems: vec!["critical path missing: docs".to_string()],
        },
    };

    assert_eq!(
        format_backup_lines(&listed),
        vec![
            "backup id=backup-2 version=1.0.0 created_at_unix_ms=1700000000000 files=6 status=invalid"
                .to_string(),
            "  problem: critical path missing: docs".to_string(),
        ]
    );
}

fn sample_result() -> UpgradeResult {
    UpgradeResult {
        succeeded: true,
        final_state: UpgradeState::Complete,
        failed_in: None,
        states: Vec::new(),
        from_version: Some(Version::new(1, 0, 0)),
        to_version: Some(Version::new(1, 2, 0)),
        plan: None,
        applied_migrations: Vec::new(),
        backup_id: None,
        backup_path: None,
        rolled_back: false,
        error: None,
    }
}
