use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "sparlo")]
#[command(version, about = "Report generation orchestration engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        /// Directory for the database and logs (default: .sparlo)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Development mode: permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Submit a challenge and start a run
    Submit {
        #[arg(long, default_value = "http://127.0.0.1:8710", env = "SPARLO_SERVER")]
        server: String,
        #[arg(long, default_value = "local")]
        account: String,
        /// Run mode: standard, discovery, or due_diligence
        #[arg(long, default_value = "standard")]
        mode: String,
        /// The challenge text to analyze
        challenge: String,
    },
    /// Follow a run until it completes or pauses
    Watch {
        #[arg(long, default_value = "http://127.0.0.1:8710", env = "SPARLO_SERVER")]
        server: String,
        run_id: String,
    },
    /// Answer (or skip) a pending clarification question
    Clarify {
        #[arg(long, default_value = "http://127.0.0.1:8710", env = "SPARLO_SERVER")]
        server: String,
        run_id: String,
        #[arg(long, conflicts_with = "skip")]
        answer: Option<String>,
        /// Resume without an answer
        #[arg(long)]
        skip: bool,
    },
    /// Show a run's current status
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8710", env = "SPARLO_SERVER")]
        server: String,
        run_id: String,
    },
    /// Show an account's usage for the current billing period
    Usage {
        #[arg(long, default_value = "http://127.0.0.1:8710", env = "SPARLO_SERVER")]
        server: String,
        account: String,
    },
    /// List the phase catalog for each run mode
    Phases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            dev,
        } => cmd::cmd_serve(port, host, data_dir, dev).await?,
        Commands::Submit {
            server,
            account,
            mode,
            challenge,
        } => cmd::cmd_submit(&server, &account, &mode, &challenge).await?,
        Commands::Watch { server, run_id } => cmd::cmd_watch(&server, &run_id).await?,
        Commands::Clarify {
            server,
            run_id,
            answer,
            skip,
        } => cmd::cmd_clarify(&server, &run_id, answer.as_deref(), skip).await?,
        Commands::Status { server, run_id } => cmd::cmd_status(&server, &run_id).await?,
        Commands::Usage { server, account } => cmd::cmd_usage(&server, &account).await?,
        Commands::Phases => cmd::cmd_phases()?,
    }

    Ok(())
}
