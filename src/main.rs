use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ensemble::api::types::CreateUnitRequest;
use ensemble::api::{AttentionItem, StatusReport};
use ensemble::config::Config;
use ensemble::core::{UnitStatus, Verdict, WorkUnit};
use ensemble::daemon::{self, DaemonStatus};
use ensemble::git::GitOps;
use ensemble::Result;

/// Ensemble - parallel agent orchestrator daemon
#[derive(Parser, Debug)]
#[command(name = "ensemble")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    ENSEMBLE_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG             Override the log filter")]
pub struct Cli {
    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Control the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// List work units
    List {
        /// Only units with this status (READY, RUNNING, BLOCKED, NEEDS_ATTENTION, DONE)
        #[arg(long)]
        status: Option<UnitStatus>,
    },

    /// Show one work unit with its history
    Show { id: String },

    /// Register a work unit
    Create {
        id: String,

        /// Higher runs first
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,

        /// Declared footprint entry; repeat for several. Read from the
        /// unit's goal document when omitted.
        #[arg(long = "path")]
        paths: Vec<String>,
    },

    /// Delete a work unit that is not running
    Delete { id: String },

    /// List units waiting for an operator
    Attention,

    /// Answer a unit's forwarded question
    Answer { id: String, answer: String },

    /// Rule on a flagged conflict: parallelize or serialize
    Verdict { id: String, verdict: Verdict },

    /// Send a unit needing attention back to READY
    Retry { id: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon (SIGTERM, then SIGKILL after the grace period)
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Run the daemon in the foreground
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// The repository's working directory, or the path itself outside git.
fn repo_root(repo: Option<PathBuf>) -> Result<PathBuf> {
    let path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    Ok(match GitOps::new(&path) {
        Ok(git) => git.repo_path().to_path_buf(),
        Err(_) => path,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let root = repo_root(cli.repo)?;

    if cli.command == (Command::Daemon { action: DaemonAction::Run }) {
        ensemble::log::init_file(&Config::log_path(&root), cli.debug)?;
        let config = Config::load(&root)?;
        return daemon::run(&root, config).await;
    }
    ensemble::log::init_stderr(cli.debug);

    match cli.command {
        Command::Daemon { action } => run_daemon(&root, action, cli.debug).await,
        Command::List { status } => {
            let units = daemon::client(&root)?.list(status).await?;
            print_units(&units);
            Ok(())
        }
        Command::Show { id } => {
            print_detail(&daemon::client(&root)?.get(&id).await?);
            Ok(())
        }
        Command::Create { id, priority, paths } => {
            let request = CreateUnitRequest {
                id,
                footprint: (!paths.is_empty()).then_some(paths),
                priority,
            };
            let unit = daemon::client(&root)?.create(&request).await?;
            println!("Created {} ({} footprint entries)", unit.id, unit.footprint.len());
            Ok(())
        }
        Command::Delete { id } => {
            daemon::client(&root)?.delete(&id).await?;
            println!("Deleted {id}");
            Ok(())
        }
        Command::Attention => {
            print_attention(&daemon::client(&root)?.attention().await?);
            Ok(())
        }
        Command::Answer { id, answer } => {
            let unit = daemon::client(&root)?.answer(&id, &answer).await?;
            println!("{}: {}", unit.id, unit.status);
            Ok(())
        }
        Command::Verdict { id, verdict } => {
            let unit = daemon::client(&root)?.verdict(&id, verdict).await?;
            println!("{}: {}", unit.id, describe(&unit));
            Ok(())
        }
        Command::Retry { id } => {
            let unit = daemon::client(&root)?.retry(&id).await?;
            println!("{}: {}", unit.id, unit.status);
            Ok(())
        }
    }
}

async fn run_daemon(root: &Path, action: DaemonAction, debug: bool) -> Result<()> {
    match action {
        DaemonAction::Start => print_status(&daemon::start(root, debug).await?),
        DaemonAction::Status => print_status(&daemon::status(root).await?),
        DaemonAction::Stop => {
            let config = Config::load(root)?;
            if daemon::stop(root, config.stop_grace()).await? {
                println!("Daemon stopped");
            } else {
                println!("Daemon is not running");
            }
        }
        DaemonAction::Run => return daemon::run(root, Config::load(root)?).await,
    }
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    match status {
        DaemonStatus::Stopped => println!("Daemon: stopped"),
        DaemonStatus::Running {
            pid,
            base_url,
            report,
        } => {
            println!("Daemon: running (pid {pid}, {base_url})");
            match report {
                Some(report) => print_report(report),
                None => println!("  API not responding yet"),
            }
        }
    }
}

fn print_report(report: &StatusReport) {
    println!("  Uptime: {}s", report.uptime_secs);
    println!(
        "  Agents: {}/{}",
        report.running_agents(),
        report.max_agents
    );
    for (status, count) in &report.counts {
        println!("  {:<16} {count}", status.as_str());
    }
}

fn describe(unit: &WorkUnit) -> String {
    match unit.status {
        UnitStatus::Blocked => {
            let on: Vec<&str> = unit.blocked_by.iter().map(|u| u.as_str()).collect();
            format!("BLOCKED on {}", on.join(", "))
        }
        UnitStatus::NeedsAttention => format!(
            "NEEDS_ATTENTION: {}",
            unit.attention_reason.as_deref().unwrap_or("")
        ),
        other => other.to_string(),
    }
}

fn print_units(units: &[WorkUnit]) {
    if units.is_empty() {
        println!("No work units");
        return;
    }
    println!("{:<24} {:<10} {:<16} DETAIL", "ID", "PHASE", "STATUS");
    for unit in units {
        let detail = match unit.status {
            UnitStatus::Blocked | UnitStatus::NeedsAttention => describe(unit),
            _ => String::new(),
        };
        println!(
            "{:<24} {:<10} {:<16} {}",
            unit.id.as_str(),
            unit.phase.as_str(),
            unit.status.as_str(),
            detail
        );
    }
}

fn print_detail(unit: &WorkUnit) {
    println!("{}", unit.id);
    println!("  Phase:    {}", unit.phase);
    println!("  Status:   {}", describe(unit));
    println!("  Priority: {}", unit.priority);
    if let Some(worktree) = &unit.worktree {
        println!("  Worktree: {}", worktree.display());
    }
    if let Some(session) = &unit.session_id {
        println!("  Session:  {session}");
    }
    if unit.completion_retries > 0 {
        println!("  Completion retries: {}", unit.completion_retries);
    }
    let footprint: Vec<&str> = unit.footprint.iter().map(String::as_str).collect();
    println!(
        "  Footprint: {}",
        if footprint.is_empty() {
            "(undeclared)".to_string()
        } else {
            footprint.join(", ")
        }
    );
    println!("  History:");
    for entry in &unit.history {
        println!(
            "    {} {:<10} {:<16} {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            entry.phase.as_str(),
            entry.status.as_str(),
            entry.note.as_deref().unwrap_or("")
        );
    }
}

fn print_attention(items: &[AttentionItem]) {
    if items.is_empty() {
        println!("Nothing needs attention");
        return;
    }
    for item in items {
        println!("{} ({})", item.id, item.phase);
        println!("  {}", item.reason);
        if !item.related.is_empty() {
            let related: Vec<&str> = item.related.iter().map(|u| u.as_str()).collect();
            println!("  Related: {}", related.join(", "));
        }
    }
}
