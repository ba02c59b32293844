use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drvault::config::EngineConfig;
use drvault::dr::RansomwareEvidence;
use drvault::engine::Engine;
use drvault::state::repository;
use drvault::workers::Workers;

#[derive(Parser)]
#[command(name = "drvault")]
#[command(about = "Versioned, encrypted, replicated backup engine with DR orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a user (generates the vault key on first run)
    Init {
        email: String,
        /// Notification channel address (e.g. Telegram chat id)
        #[arg(long)]
        notify_addr: Option<String>,
    },
    /// Set or change a user's notification address
    SetNotify {
        email: String,
        notify_addr: String,
    },
    /// Back up a single file
    Backup {
        #[arg(long)]
        user: i64,
        path: PathBuf,
    },
    /// Back up a folder into one snapshot
    Snapshot {
        #[arg(long)]
        user: i64,
        dir: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    /// Request a one-time restore code
    RequestCode {
        #[arg(long)]
        user: i64,
        #[arg(long, default_value = "restore")]
        purpose: String,
    },
    /// Restore a file version (latest when --version is omitted)
    Restore {
        #[arg(long)]
        user: i64,
        filename: String,
        #[arg(long)]
        version: Option<i64>,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        code: String,
    },
    /// Restore every file in a snapshot
    RestoreSnapshot {
        #[arg(long)]
        user: i64,
        snapshot: i64,
        #[arg(long)]
        target_dir: PathBuf,
        #[arg(long)]
        code: Option<String>,
    },
    /// Print the DR status report
    Report {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Run a DR drill: restore the newest snapshot into a scratch dir
    Drill {
        #[arg(long)]
        user: i64,
        scratch_dir: PathBuf,
    },
    /// Recover a lost device from the newest snapshot
    Recover {
        #[arg(long)]
        user: i64,
        target_dir: PathBuf,
    },
    /// Flag suspected ransomware activity on the given paths
    Ransomware {
        #[arg(long)]
        user: i64,
        #[arg(long, default_value = "manual_report")]
        reason: String,
        files: Vec<String>,
    },
    /// Show recent audit-log lines
    Audit {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Mark a DR event as handled
    ResolveEvent { event_id: i64 },
    /// Run the background workers until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let engine = Engine::new(config).await?;

    match cli.command {
        Commands::Init { email, notify_addr } => {
            let user =
                repository::create_user(engine.pool(), &email, notify_addr.as_deref()).await?;
            println!("Registered user {} ({})", user.id, user.email);
        }
        Commands::SetNotify { email, notify_addr } => {
            match repository::get_user_by_email(engine.pool(), &email).await? {
                Some(user) => {
                    repository::set_notify_addr(engine.pool(), user.id, &notify_addr).await?;
                    println!("Notification address updated for {}", user.email);
                }
                None => println!("No such user: {email}"),
            }
        }
        Commands::Backup { user, path } => {
            let entry = engine.backup_file(user, &path).await?;
            println!(
                "Backed up {} as v{} ({})",
                entry.filename, entry.version, entry.locator
            );
        }
        Commands::Snapshot { user, dir, description } => {
            let report = engine.backup_tree(user, &dir, description.as_deref()).await?;
            println!(
                "Snapshot {}: {} files backed up, {} failed",
                report.snapshot_id,
                report.backed_up.len(),
                report.failed.len()
            );
            for (path, reason) in &report.failed {
                println!("  failed: {} ({reason})", path.display());
            }
        }
        Commands::RequestCode { user, purpose } => {
            let outcome = engine.request_code(user, &purpose).await?;
            if outcome.delivered {
                println!("Code sent, valid until {}", outcome.expires_at);
            } else {
                println!(
                    "Code created (valid until {}) but delivery failed; check notifier configuration",
                    outcome.expires_at
                );
            }
            if let Some(code) = outcome.code {
                println!("Code (debug): {code}");
            }
        }
        Commands::Restore { user, filename, version, target, code } => {
            let entry = engine
                .restore_file(user, &filename, version, &target, &code)
                .await?;
            println!(
                "Restored {} v{} to {}",
                entry.filename,
                entry.version,
                target.display()
            );
        }
        Commands::RestoreSnapshot { user, snapshot, target_dir, code } => {
            let report = engine
                .restore_snapshot(user, snapshot, &target_dir, code.as_deref())
                .await?;
            println!(
                "Snapshot {}: {} restored, {} failed",
                report.snapshot_id,
                report.restored.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!("  failed: {} v{} ({})", failure.filename, failure.version, failure.reason);
            }
        }
        Commands::Report { user, json } => {
            let report = engine.report(user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.render_text());
            }
        }
        Commands::Drill { user, scratch_dir } => {
            let report = engine.run_drill(user, &scratch_dir).await?;
            println!(
                "Drill complete: {} restored, {} failed",
                report.restored.len(),
                report.failed.len()
            );
        }
        Commands::Recover { user, target_dir } => {
            let report = engine.recover_device(user, &target_dir).await?;
            println!(
                "Device recovery: {} restored, {} failed",
                report.restored.len(),
                report.failed.len()
            );
        }
        Commands::Ransomware { user, reason, files } => {
            let evidence = RansomwareEvidence { files, reason };
            engine.respond_ransomware(user, &evidence).await?;
            println!("Ransomware response recorded; defensive snapshot created");
        }
        Commands::Audit { user, limit } => {
            for line in repository::recent_audit(engine.pool(), user, limit).await? {
                println!(
                    "[{}] {} {}",
                    line.logged_at,
                    line.action,
                    line.details.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::ResolveEvent { event_id } => {
            if repository::mark_dr_event_handled(engine.pool(), event_id).await? {
                println!("Event {event_id} marked handled");
            } else {
                println!("No such event: {event_id}");
            }
        }
        Commands::Run => {
            let workers = Workers::start(Arc::new(engine));
            println!("Workers running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            workers.stop().await;
        }
    }

    Ok(())
}
