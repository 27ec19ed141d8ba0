use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use kitup_core::{ToolkitLayout, UpgradeError, UpgradeSettings};
use kitup_installer::{list_tree_files, MigrationCatalog, MigrationContext, UpgradeLock};
use kitup_registry::VersionSource;
use kitup_resolver::TargetVersion;
use kitup_security::{sha256_hex, tree_digest, TreeDigest};
use semver::Version;

use crate::{
    render_plan_lines, CancellationToken, Confirm, SourcePreference, StateMachine,
    UpgradeOptions, UpgradeOrchestrator, UpgradePlan, UpgradeState,
};

const MIGRATIONS: &str = r#"
[[migration]]
version = "1.2.0"
description = "second step"
implementation = "log_second"

[[migration]]
version = "1.1.0"
description = "first step"
implementation = "log_first"
"#;

#[test]
fn state_machine_allows_only_documented_transitions() {
    use UpgradeState::*;
    assert!(Idle.can_transition_to(DetectingSource));
    assert!(Previewing.can_transition_to(Stopped));
    assert!(Previewing.can_transition_to(AwaitingConfirmation));
    assert!(BackingUp.can_transition_to(RollingBack));
    assert!(Migrating.can_transition_to(RollingBack));
    assert!(RollingBack.can_transition_to(Fatal));

    assert!(!Idle.can_transition_to(BackingUp));
    assert!(!Previewing.can_transition_to(RollingBack));
    assert!(!AwaitingConfirmation.can_transition_to(Merging));
    assert!(!Merging.can_transition_to(Aborted));
    assert!(!Complete.can_transition_to(RollingBack));
    assert!(!RolledBack.can_transition_to(Complete));

    let mut machine = StateMachine::default();
    machine.advance(DetectingSource).expect("detect");
    machine.advance(Previewing).expect("preview");
    let err = machine
        .advance(Merging)
        .expect_err("skipping backup is illegal");
    assert!(err.to_string().contains("previewing -> merging"));
    assert_eq!(machine.current(), Previewing);
    assert_eq!(machine.history(), &[Idle, DetectingSource, Previewing]);
    assert!(Complete.is_terminal() && Fatal.is_terminal() && !Validating.is_terminal());
}

#[test]
fn source_preference_parses_cli_forms() {
    assert_eq!(
        "auto".parse::<SourcePreference>().expect("auto"),
        SourcePreference::Auto
    );
    assert_eq!(
        "registry".parse::<SourcePreference>().expect("registry"),
        SourcePreference::Registry
    );
    assert_eq!(
        "local".parse::<SourcePreference>().expect("local"),
        SourcePreference::Local(None)
    );
    assert_eq!(
        "local:/opt/kit".parse::<SourcePreference>().expect("local path"),
        SourcePreference::Local(Some(PathBuf::from("/opt/kit")))
    );
    assert!("local:".parse::<SourcePreference>().is_err());
    assert!("ftp".parse::<SourcePreference>().is_err());
}

#[test]
fn dry_run_previews_without_touching_install() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();

    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), true, false));

    assert!(result.succeeded, "error: {:?}", result.error);
    assert_eq!(result.final_state, UpgradeState::Stopped);
    assert_eq!(fixture.install_digest(), before);
    assert!(result.backup_id.is_none());
    assert!(fs::read_dir(fixture.layout.backups_dir())
        .expect("backups dir")
        .next()
        .is_none());

    let plan = result.plan.expect("dry run returns plan");
    assert!(plan.dry_run);
    assert_eq!(
        plan.migration_versions(),
        vec![Version::new(1, 1, 0), Version::new(1, 2, 0)]
    );
    assert_eq!(plan.files_to_remove(), ["scripts/old.sh".to_string()]);

    let lines = render_plan_lines(&plan);
    assert_eq!(
        lines[0],
        format!(
            "upgrade_preview from=1.0.0 to=1.2.0 mode=dry-run source=local:{}",
            fixture.candidate.display()
        )
    );
    assert!(lines.contains(&"change_remove path=scripts/old.sh".to_string()));
    let first = position(&lines, "migration order=1 version=1.1.0");
    let second = position(&lines, "migration order=2 version=1.2.0");
    assert!(first < second);
}

#[test]
fn forced_upgrade_applies_files_and_migrations_in_order() {
    let fixture = Fixture::new();
    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, true));

    assert!(result.succeeded, "error: {:?}", result.error);
    assert_eq!(result.final_state, UpgradeState::Complete);
    assert_eq!(
        result.applied_migrations,
        vec![Version::new(1, 1, 0), Version::new(1, 2, 0)]
    );
    assert_eq!(
        fs::read_to_string(fixture.install.join("migration.log")).expect("log"),
        "1.1.0\n1.2.0\n"
    );
    assert!(fs::read_to_string(fixture.install.join("toolkit.toml"))
        .expect("manifest")
        .contains("1.2.0"));
    assert!(!fixture.install.join("scripts/old.sh").exists());
    assert_eq!(
        fs::read_to_string(fixture.install.join("config.toml")).expect("config"),
        "autosave = true\ntheme = \"solarized\"\n"
    );
    assert!(fixture.install.join("cache/blob").exists());

    let backup_path = result.backup_path.expect("backup recorded");
    assert!(backup_path.join("backup.json").is_file());
    assert!(!fixture.layout.lock_path().exists());
    assert_eq!(
        result.states,
        vec![
            UpgradeState::Idle,
            UpgradeState::DetectingSource,
            UpgradeState::Previewing,
            UpgradeState::AwaitingConfirmation,
            UpgradeState::BackingUp,
            UpgradeState::Merging,
            UpgradeState::Migrating,
            UpgradeState::Validating,
            UpgradeState::Complete,
        ]
    );
}

#[test]
fn confirmation_is_required_unless_skipped() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();

    let declined = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, false));
    assert!(matches!(declined.error, Some(UpgradeError::Declined)));
    assert_eq!(declined.final_state, UpgradeState::Aborted);
    assert_eq!(declined.failed_in, Some(UpgradeState::AwaitingConfirmation));
    assert_eq!(declined.exit_code(), 1);
    assert_eq!(fixture.install_digest(), before);

    let approved = fixture
        .orchestrator(None)
        .with_confirmer(Answer(true))
        .upgrade(&options(SourcePreference::Local(None), false, false));
    assert!(approved.succeeded, "error: {:?}", approved.error);
}

#[test]
fn failing_migration_rolls_back_to_identical_tree() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();
    let mut catalog = test_catalog();
    catalog.register("log_second", |_| Err(anyhow!("disk full")));

    let result = fixture
        .orchestrator(Some(catalog))
        .upgrade(&options(SourcePreference::Local(None), false, true));

    assert!(!result.succeeded);
    assert!(result.rolled_back);
    assert_eq!(result.final_state, UpgradeState::RolledBack);
    assert_eq!(result.failed_in, Some(UpgradeState::Migrating));
    assert_eq!(result.applied_migrations, vec![Version::new(1, 1, 0)]);
    assert!(matches!(
        result.error,
        Some(UpgradeError::MigrationFailed { ref version, .. }) if *version == Version::new(1, 2, 0)
    ));
    assert_eq!(fixture.install_digest(), before);
    assert!(result.backup_id.is_some());
}

#[test]
fn failed_rollback_reports_backup_location() {
    let fixture = Fixture::new();
    let mut catalog = test_catalog();
    catalog.register("log_second", |context: &MigrationContext<'_>| {
        let root = context
            .install_dir
            .parent()
            .ok_or_else(|| anyhow!("install has no parent"))?;
        fs::remove_dir_all(root.join("backups"))?;
        Err(anyhow!("destroyed backups"))
    });

    let result = fixture
        .orchestrator(Some(catalog))
        .upgrade(&options(SourcePreference::Local(None), false, true));

    assert_eq!(result.final_state, UpgradeState::Fatal);
    assert_eq!(result.exit_code(), 4);
    assert!(!result.rolled_back);
    match result.error {
        Some(UpgradeError::RollbackFailed {
            backup_id,
            backup_path,
            ..
        }) => {
            assert_eq!(Some(backup_id), result.backup_id);
            assert_eq!(Some(backup_path), result.backup_path);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn merge_conflict_aborts_before_backup() {
    let fixture = Fixture::new();
    fs::write(fixture.install.join("config.toml"), "theme = \"mine\"\n").expect("user edit");
    fs::write(
        fixture.candidate.join("defaults/config.toml"),
        "theme = \"dark\"\n",
    )
    .expect("shipped change");
    let before = fixture.install_digest();

    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, true));

    assert!(matches!(
        result.error,
        Some(UpgradeError::MergeConflict { ref path, .. }) if path == "config.toml"
    ));
    assert_eq!(result.failed_in, Some(UpgradeState::Previewing));
    assert!(result.backup_id.is_none());
    assert_eq!(fixture.install_digest(), before);
}

#[test]
fn unreachable_registry_falls_back_to_local_source() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    let fixture = Fixture::new();

    let result = fixture
        .orchestrator_with_registry(&url)
        .upgrade(&options(SourcePreference::Auto, false, true));

    assert!(result.succeeded, "error: {:?}", result.error);
    assert_eq!(result.to_version, Some(Version::new(1, 2, 0)));
    let plan = result.plan.expect("plan");
    assert_eq!(
        plan.source,
        VersionSource::LocalDirectory(fixture.candidate.clone())
    );
    drop(listener);
}

#[test]
fn registry_release_is_staged_and_applied() {
    let fixture = Fixture::new();
    let url = serve_release(&fixture.candidate, "1.2.0");

    let result = fixture
        .orchestrator_with_registry(&url)
        .upgrade(&options(SourcePreference::Registry, false, true));

    assert!(result.succeeded, "error: {:?}", result.error);
    let plan = result.plan.expect("plan");
    assert!(plan.source.is_remote());
    assert_eq!(
        plan.incoming_dir,
        fixture.layout.staging_path("1.2.0")
    );
    assert!(!plan.incoming_dir.exists());
    assert_eq!(
        fs::read_to_string(fixture.install.join("docs/guide.md")).expect("doc"),
        "guide v2"
    );
}

#[test]
fn no_usable_source_names_every_attempt() {
    let fixture = Fixture::new();
    let settings = UpgradeSettings {
        remote_timeout_ms: 200,
        ..UpgradeSettings::default()
    };
    let orchestrator =
        UpgradeOrchestrator::new(fixture.layout.clone(), settings).expect("orchestrator");

    let result = orchestrator.upgrade(&options(SourcePreference::Auto, false, true));
    assert_eq!(result.exit_code(), 2);
    assert_eq!(result.failed_in, Some(UpgradeState::DetectingSource));
    match result.error {
        Some(UpgradeError::NoUsableSource { attempts }) => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].label, "registry");
            assert_eq!(attempts[1].label, "local");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn downgrade_and_same_version_do_nothing() {
    let fixture = Fixture::new();
    write_tree(&fixture.candidate, "0.9.0", "old");
    let before = fixture.install_digest();
    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, true));
    assert!(matches!(result.error, Some(UpgradeError::Downgrade { .. })));
    assert_eq!(fixture.install_digest(), before);

    write_tree(&fixture.candidate, "1.0.0", "same");
    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, true));
    assert!(result.is_up_to_date());
    assert_eq!(result.exit_code(), 0);
}

#[test]
fn concurrent_run_is_rejected_by_lock() {
    let fixture = Fixture::new();
    let _held = UpgradeLock::acquire(&fixture.layout.lock_path()).expect("hold lock");

    let result = fixture
        .orchestrator(None)
        .upgrade(&options(SourcePreference::Local(None), false, true));
    assert!(matches!(result.error, Some(UpgradeError::Locked { .. })));
    assert_eq!(result.final_state, UpgradeState::Aborted);
}

#[test]
fn cancellation_before_backup_leaves_install_untouched() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();
    let token = CancellationToken::new();

    let result = fixture
        .orchestrator(None)
        .with_cancellation(token.clone())
        .with_confirmer(CancelOnConfirm(token))
        .upgrade(&options(SourcePreference::Local(None), false, false));

    assert!(matches!(
        result.error,
        Some(UpgradeError::Cancelled { ref state }) if state == "awaiting_confirmation"
    ));
    assert!(result.backup_id.is_none());
    assert_eq!(fixture.install_digest(), before);
}

#[test]
fn cancellation_after_backup_rolls_back() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();
    let token = migration_cancel_token().clone();
    let mut catalog = test_catalog();
    catalog.register("log_second", |_| {
        migration_cancel_token().cancel();
        Ok(())
    });

    let result = fixture
        .orchestrator(Some(catalog))
        .with_cancellation(token)
        .upgrade(&options(SourcePreference::Local(None), false, true));

    assert!(matches!(
        result.error,
        Some(UpgradeError::Cancelled { ref state }) if state == "migrating"
    ));
    assert_eq!(result.failed_in, Some(UpgradeState::Migrating));
    assert_eq!(result.final_state, UpgradeState::RolledBack);
    assert!(result.rolled_back);
    assert!(result.backup_id.is_some());
    assert_eq!(fixture.install_digest(), before);
}

#[test]
fn invalid_backup_aborts_without_touching_install() {
    let fixture = Fixture::new();
    let before = fixture.install_digest();
    let settings = UpgradeSettings {
        backup_exclusions: vec!["cache/**".to_string(), "docs/**".to_string()],
        ..fixture.settings(None)
    };
    let orchestrator = UpgradeOrchestrator::new(fixture.layout.clone(), settings)
        .expect("orchestrator")
        .with_catalog(test_catalog());

    let result = orchestrator.upgrade(&options(SourcePreference::Local(None), false, true));

    assert_eq!(result.exit_code(), 3);
    assert!(matches!(
        result.error,
        Some(UpgradeError::BackupValidationFailed { ref problems, .. })
            if problems.iter().any(|problem| problem.contains("docs"))
    ));
    assert_eq!(result.failed_in, Some(UpgradeState::BackingUp));
    assert_eq!(result.final_state, UpgradeState::Aborted);
    assert!(!result.rolled_back);
    assert_eq!(fixture.install_digest(), before);
}

#[test]
fn check_for_updates_uses_fallback_source() {
    let fixture = Fixture::new();
    let (source, check) = fixture
        .orchestrator(None)
        .check_for_updates(&SourcePreference::Auto)
        .expect("check");
    assert_eq!(source, VersionSource::LocalDirectory(fixture.candidate.clone()));
    assert!(check.has_update);
    assert_eq!(check.info.latest(), &Version::new(1, 2, 0));
}

struct Answer(bool);

impl Confirm for Answer {
    fn confirm(&self, _plan: &UpgradePlan) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

struct CancelOnConfirm(CancellationToken);

impl Confirm for CancelOnConfirm {
    fn confirm(&self, _plan: &UpgradePlan) -> anyhow::Result<bool> {
        self.0.cancel();
        Ok(true)
    }
}

struct Fixture {
    root: PathBuf,
    layout: ToolkitLayout,
    install: PathBuf,
    candidate: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = test_root();
        let layout = ToolkitLayout::new(&root);
        let install = layout.install_dir().to_path_buf();
        let candidate = root.join("candidate");

        write_tree(&install, "1.0.0", "guide");
        fs::write(install.join("scripts/old.sh"), "#!/bin/sh\n").expect("old script");
        fs::write(install.join("config.toml"), "theme = \"solarized\"\n").expect("user config");
        fs::create_dir_all(install.join("cache")).expect("cache dir");
        fs::write(install.join("cache/blob"), "regenerable").expect("cache");

        write_tree(&candidate, "1.2.0", "guide v2");
        fs::write(
            candidate.join("defaults/config.toml"),
            "theme = \"light\"\nautosave = true\n",
        )
        .expect("new defaults");
        fs::write(candidate.join("migrations.toml"), MIGRATIONS).expect("migrations");

        Self {
            root,
            layout,
            install,
            candidate,
        }
    }

    fn settings(&self, registry_url: Option<&str>) -> UpgradeSettings {
        UpgradeSettings {
            registry_url: registry_url.map(str::to_string),
            local_source: Some(self.candidate.clone()),
            remote_timeout_ms: 200,
            ..UpgradeSettings::default()
        }
    }

    fn orchestrator(&self, catalog: Option<MigrationCatalog>) -> UpgradeOrchestrator {
        UpgradeOrchestrator::new(self.layout.clone(), self.settings(None))
            .expect("orchestrator")
            .with_catalog(catalog.unwrap_or_else(test_catalog))
    }

    fn orchestrator_with_registry(&self, url: &str) -> UpgradeOrchestrator {
        UpgradeOrchestrator::new(self.layout.clone(), self.settings(Some(url)))
            .expect("orchestrator")
            .with_catalog(test_catalog())
    }

    fn install_digest(&self) -> TreeDigest {
        tree_digest(&self.install, |_| false).expect("digest")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn options(source: SourcePreference, dry_run: bool, skip_confirmation: bool) -> UpgradeOptions {
    UpgradeOptions {
        target: TargetVersion::Latest,
        source,
        dry_run,
        skip_confirmation,
    }
}

/// Token a plain `fn` migration can reach; only one test cancels through it.
fn migration_cancel_token() -> &'static CancellationToken {
    static TOKEN: OnceLock<CancellationToken> = OnceLock::new();
    TOKEN.get_or_init(CancellationToken::new)
}

fn test_catalog() -> MigrationCatalog {
    let mut catalog = MigrationCatalog::builtin();
    catalog.register("log_first", |context| append_log(context, "1.1.0"));
    catalog.register("log_second", |context| append_log(context, "1.2.0"));
    catalog
}

fn append_log(context: &MigrationContext<'_>, line: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(context.install_dir.join("migration.log"))?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn write_tree(root: &Path, version: &str, guide: &str) {
    for dir in ["templates", "docs", "scripts", "defaults"] {
        fs::create_dir_all(root.join(dir)).expect("must create subdir");
    }
    fs::write(
        root.join("toolkit.toml"),
        format!("name = \"toolkit\"\nversion = \"{version}\"\n"),
    )
    .expect("must write manifest");
    fs::write(root.join("templates/page.md"), "# page").expect("template");
    fs::write(root.join("docs/guide.md"), guide).expect("doc");
    fs::write(root.join("scripts/run.sh"), "#!/bin/sh\n").expect("script");
    fs::write(root.join("defaults/config.toml"), "theme = \"light\"\n").expect("defaults");
}

fn position(lines: &[String], prefix: &str) -> usize {
    lines
        .iter()
        .position(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("missing line starting with {prefix}"))
}

fn serve_release(tree: &Path, version: &str) -> String {
    let files = list_tree_files(tree, &|_| false).expect("list release");
    let mut routes = Vec::new();
    let mut entries = Vec::new();
    for path in &files {
        let bytes = fs::read(tree.join(path)).expect("read release file");
        entries.push(format!(
            "{{\"path\":\"{path}\",\"sha256\":\"{}\"}}",
            sha256_hex(&bytes)
        ));
        routes.push((format!("/releases/{version}/files/{path}"), bytes));
    }
    routes.push((
        format!("/releases/{version}/files.json"),
        format!(
            "{{\"version\":\"{version}\",\"files\":[{}]}}",
            entries.join(",")
        )
        .into_bytes(),
    ));
    routes.push((
        "/index.json".to_string(),
        format!("{{\"name\":\"toolkit\",\"latest\":\"{version}\",\"releases\":[\"{version}\"]}}")
            .into_bytes(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            respond(stream, &routes);
        }
    });
    format!("http://{addr}")
}

fn respond(mut stream: TcpStream, routes: &[(String, Vec<u8>)]) {
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(reader_stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header == "\r\n" || header == "\n" => break,
            Ok(_) => {}
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = routes
        .iter()
        .find(|(route, _)| route == path)
        .map(|(_, body)| (200, body.clone()))
        .unwrap_or((404, b"not found".to_vec()));
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        if status == 200 { "OK" } else { "Not Found" },
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

fn test_root() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!(
        "kitup-upgrade-tests-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&root).expect("must create test root");
    root
}
