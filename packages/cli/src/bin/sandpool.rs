// ABOUTME: sandpool command-line entry point
// ABOUTME: Runs the scheduling service or queries and rescales a running one

use clap::{Parser, Subcommand};
use colored::*;
use sandpool_cli::telemetry::{init_tracing, DEFAULT_LOG_FILTER};
use sandpool_cli::{EnvConfig, ServeArgs};
use sandpool_config::constants::SANDPOOL_URL;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "sandpool")]
#[command(about = "Sandbox pool scheduler for RL rollout workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling service
    Serve(ServeArgs),
    /// Show pool health of a running scheduler
    Status {
        #[arg(long, env = SANDPOOL_URL, default_value = "http://127.0.0.1:8080")]
        url: String,
        /// Also list every slot
        #[arg(long)]
        slots: bool,
    },
    /// Change the baseline size of a running scheduler
    Scale {
        #[arg(long, env = SANDPOOL_URL, default_value = "http://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        baseline: usize,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => {
            init_tracing(DEFAULT_LOG_FILTER);
            let env = EnvConfig::from_env()?;
            sandpool_cli::run(args, env).await
        }
        Commands::Status { url, slots } => {
            init_tracing("sandpool=warn");
            cli::pool::status_command(&url, slots).await
        }
        Commands::Scale { url, baseline } => {
            init_tracing("sandpool=warn");
            cli::pool::scale_command(&url, baseline).await
        }
    }
}
