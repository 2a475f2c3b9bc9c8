//! Autobkp - Main entry point
//!
//! Incremental backups with a restorable version history.

use anyhow::Result;
use autobkp::executor::archive::format_timestamp;
use autobkp::executor::progress::{format_bytes, format_duration};
use autobkp::executor::restore::parse_timestamp;
use autobkp::executor::RunSummary;
use autobkp::utils::{self, shutdown::ShutdownCoordinator};
use autobkp::{BackupEngine, Config};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup pass
    Run {
        /// Source directory (overrides config)
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,

        /// Backup root (overrides config)
        #[arg(long, value_name = "DIR")]
        backup: Option<PathBuf>,

        /// Scan and diff only; write nothing
        #[arg(long)]
        dry_run: bool,

        /// Compare content hashes instead of size + mtime
        #[arg(long)]
        verify_hash: bool,
    },

    /// Show the version history of one path
    History {
        /// Path relative to the source root
        path: String,
    },

    /// Restore the tree as of a point in time
    Restore {
        /// Empty or missing target directory
        #[arg(long, value_name = "DIR")]
        to: PathBuf,

        /// RFC 3339 or YYYYMMDDTHHMMSS.ffffffZ (default: latest)
        #[arg(long)]
        at: Option<String>,
    },

    /// Check every stored artifact against its recorded hash
    Verify,

    /// Remove artifacts beyond the newest N versions of each path
    Prune {
        /// Versions to keep (overrides retention.keep_versions)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    let mut dry_run = false;
    if let Command::Run {
        source,
        backup,
        dry_run: dry,
        verify_hash,
    } = &args.command
    {
        if let Some(source) = source {
            config.paths.source = source.clone();
        }
        if let Some(backup) = backup {
            config.paths.backup = backup.clone();
        }
        config.scan.verify_hash |= *verify_hash;
        dry_run = *dry;
    }

    let engine = BackupEngine::new(config)?;

    // Initialize logging; backup runs also get a per-run log file
    let config = engine.config();
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let run_log = match &args.command {
        Command::Run { .. } if config.log.to_file && !dry_run => Some(
            config
                .log_dir()
                .join(format!("run-{}.log", format_timestamp(Utc::now()))),
        ),
        _ => None,
    };
    utils::logger::init(log_level, run_log.as_deref())?;

    tracing::info!("autobkp v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Run { .. } => {
            let shutdown = ShutdownCoordinator::new();
            shutdown.listen();

            let summary = engine.run(&shutdown.token(), dry_run).await?;
            print_summary(&summary);
            if summary.has_errors() {
                return Ok(ExitCode::from(2));
            }
        }

        Command::History { path } => {
            let manifest = engine.load_manifest()?;
            for entry in engine.history(&path)? {
                let pruned = entry
                    .artifact
                    .as_ref()
                    .is_some_and(|a| manifest.pruned.contains(a));
                println!(
                    "v{:<4} {}  {:<7} {:>12}  {}{}",
                    entry.version,
                    entry.timestamp.to_rfc3339(),
                    format!("{:?}", entry.status).to_lowercase(),
                    format_bytes(entry.size),
                    entry.artifact.as_deref().unwrap_or("-"),
                    if pruned { " (pruned)" } else { "" }
                );
            }
        }

        Command::Restore { to, at } => {
            let at = at.as_deref().map(parse_timestamp).transpose()?;
            let report = engine.restore(at, &to).await?;
            println!(
                "Restored {} files, {} symlinks and {} directories ({}) into {}",
                report.files,
                report.symlinks,
                report.directories,
                format_bytes(report.bytes),
                to.display()
            );
            if report.pruned > 0 {
                println!("{} paths skipped: artifact pruned", report.pruned);
            }
            for diagnostic in &report.diagnostics {
                println!("  {}", diagnostic);
            }
            if !report.diagnostics.is_empty() {
                return Ok(ExitCode::from(2));
            }
        }

        Command::Verify => {
            let report = engine.verify().await?;
            println!(
                "Checked {} artifacts: {} ok, {} missing, {} mismatched, {} pruned",
                report.checked,
                report.ok,
                report.missing(),
                report.mismatched(),
                report.pruned
            );
            for problem in &report.problems {
                println!(
                    "  {} v{} ({}): {:?}",
                    problem.path, problem.version, problem.artifact, problem.status
                );
            }
            if !report.is_clean() {
                return Ok(ExitCode::from(2));
            }
        }

        Command::Prune { keep } => {
            let keep = keep
                .or(engine.config().retention.keep_versions)
                .ok_or_else(|| anyhow::anyhow!("no --keep given and retention.keep_versions is unset"))?;
            let report = engine.prune(keep).await?;
            println!(
                "Pruned {} artifacts, {} freed (keeping {} versions per path)",
                report.pruned.len(),
                format_bytes(report.freed_bytes),
                report.keep
            );
            for diagnostic in &report.diagnostics {
                println!("  {}", diagnostic);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    let verb = if summary.dry_run { "would archive" } else { "archived" };
    println!(
        "Run {}{}",
        format_timestamp(summary.timestamp),
        if summary.dry_run { " (dry run)" } else { "" }
    );
    println!(
        "  unchanged: {}  modified: {}  new: {}  deleted: {}  skipped: {}  failed: {}",
        summary.unchanged,
        summary.modified,
        summary.new,
        summary.deleted,
        summary.skipped,
        summary.failed
    );
    println!(
        "  {} {} ({} stored) in {}",
        verb,
        format_bytes(summary.bytes_archived),
        format_bytes(summary.stored_bytes),
        format_duration(summary.duration.as_secs())
    );
    for diagnostic in &summary.diagnostics {
        println!("  {}", diagnostic);
    }
}
