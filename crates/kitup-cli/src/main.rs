use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kitup_resolver::TargetVersion;
use kitup_upgrade::SourcePreference;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod prompt;
mod render;

use dispatch::run_cli;

#[derive(Parser, Debug)]
#[command(name = "kitup")]
#[command(about = "Upgrade an installed toolkit asset tree in place", long_about = None)]
struct Cli {
    /// State root holding backups, staging and the upgrade lock.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Toolkit install to operate on (defaults to `<state-dir>/toolkit`).
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Disable colours and progress output.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade the install to a newer toolkit version.
    Upgrade(UpgradeArgs),
    /// Report the installed and latest available versions.
    Check {
        #[arg(long, default_value = "auto")]
        source: SourcePreference,
    },
    /// Inspect and manage pre-upgrade backups.
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug)]
struct UpgradeArgs {
    /// Compute and print the plan without changing anything.
    #[arg(long)]
    dry_run: bool,
    /// Apply without asking for confirmation.
    #[arg(long)]
    force: bool,
    /// auto, registry, local or local:<path>.
    #[arg(long, default_value = "auto")]
    source: SourcePreference,
    /// An exact version, a semver requirement, or `latest`.
    #[arg(long, default_value = "latest")]
    target_version: TargetVersion,
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    List,
    /// Replace the install with the contents of a backup.
    Restore {
        backup_id: String,
        /// Keep excluded subtrees (caches and the like) of the current install.
        #[arg(long)]
        preserve_regenerable: bool,
    },
    /// Remove valid backups beyond the newest N.
    Prune {
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        keep: Option<u64>,
    },
    Remove {
        backup_id: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: u8) {
    let level_filter = log_level_for(verbose);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("KITUP_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn log_level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests;
