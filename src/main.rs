//! # chronod — calendar-driven job scheduling daemon
//!
//! Runs schedules with calendar recurrence rules, supervises their
//! processes, and serves a line-delimited JSON control socket for live
//! monitoring.
//!
//! Usage:
//!   chronod                         # Run the daemon
//!   chronod --port 10900            # Custom control port
//!   chronod check schedules.json    # Validate a schedule file and exit

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chronod_core::ChronodConfig;
use chronod_gateway::Gateway;
use chronod_sched::{Daemon, Event, ScheduleDef};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chronod", version, about = "Calendar-driven job scheduling daemon")]
struct Cli {
    /// Config file (default: ~/.chronod/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control socket port override
    #[arg(short, long)]
    port: Option<u16>,

    /// State directory override
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a schedule definition file and exit
    Check {
        /// JSON file mapping schedule names to definitions
        file: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ChronodConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ChronodConfig::load().context("loading configuration")?,
    };
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    let filter = if cli.verbose {
        "chronod=debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Some(Command::Check { file }) = cli.command {
        return check_schedules(&file);
    }

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating {}", config.state_dir.display()))?;

    let mut daemon = Daemon::new(config.clone());
    let events = daemon.event_sender();

    let gateway = Gateway::bind(&config, events.clone()).await?;
    tokio::spawn(gateway.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(Event::Shutdown);
        }
    });

    daemon.run().await?;
    Ok(())
}

/// Validate every schedule in a JSON file, reporting per-schedule problems.
fn check_schedules(file: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let raw: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&text).context("schedule file must be a JSON object")?;

    let mut bad = 0;
    for (name, value) in &raw {
        match ScheduleDef::validate(value) {
            Ok(_) => println!("{name}: ok"),
            Err(e) => {
                println!("{name}: {e}");
                bad += 1;
            }
        }
    }
    if bad > 0 {
        anyhow::bail!("{bad} of {} schedules invalid", raw.len());
    }
    println!("{} schedules valid", raw.len());
    Ok(())
}
