//! # ScriptBeat
//!
//! Cron-driven script scheduler: runs shell/Python/Node scripts on
//! seconds-precision cron schedules, records every outcome, and notifies
//! configured webhooks on completion.
//!
//! Usage:
//!   scriptbeat serve                     # Run the scheduler daemon
//!   scriptbeat run <script-id>           # Execute one script ad-hoc
//!   scriptbeat validate "*/5 * * * * *"  # Check a cron expression
//!   scriptbeat stats                     # Print store counters

mod app;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use app::App;
use scriptbeat_core::ServiceConfig;

#[derive(Parser)]
#[command(name = "scriptbeat", version, about = "Cron-driven script scheduler")]
struct Cli {
    /// Data directory (default: ~/.scriptbeat)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon until ctrl-c
    Serve,
    /// Execute one script immediately and print the record
    Run {
        script_id: String,
        /// Also send notifications for this run
        #[arg(long)]
        notify: bool,
    },
    /// Validate a cron expression (six fields, seconds enabled)
    Validate { expr: String },
    /// Print store counters
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "scriptbeat=debug"
    } else {
        "scriptbeat=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = ServiceConfig::load()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let app = App::open(config)?;

    match cli.command {
        Command::Serve => {
            app.start().await?;
            tracing::info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            app.stop().await;
        }
        Command::Run { script_id, notify } => {
            let log = app.run_script(&script_id, notify).await?;
            println!("{}", serde_json::to_string_pretty(&log)?);
            if !log.success {
                std::process::exit(1);
            }
        }
        Command::Validate { expr } => match app.validate_cron(&expr) {
            Ok(()) => println!("ok"),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&app.stats())?);
        }
    }

    Ok(())
}
