//! clawloop CLI: the main entry point.
//!
//! Commands:
//! - `config`: print the effective configuration (or its path)
//! - `replay`: run the agent against a scripted model and print the event stream

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "clawloop",
    about = "clawloop: a tool-calling agent execution engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CLAWLOOP_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },

    /// Replay a scripted model run and print events as JSON lines
    Replay {
        /// JSON file holding the scripted model turns
        #[arg(short, long)]
        script: PathBuf,

        /// The user message that opens the run
        #[arg(short, long)]
        message: String,

        /// System prompt for the run
        #[arg(long)]
        system: Option<String>,

        /// Stream model output as deltas
        #[arg(long)]
        stream: bool,

        /// Override the step budget
        #[arg(long)]
        max_steps: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Config { path } => commands::config_cmd::run(path)?,
        Commands::Replay {
            script,
            message,
            system,
            stream,
            max_steps,
        } => {
            commands::replay::run(commands::replay::ReplayArgs {
                script,
                message,
                system,
                stream,
                max_steps,
            })
            .await?
        }
    }

    Ok(())
}
