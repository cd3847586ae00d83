//! vigil — restaurant multi-camera surveillance orchestration core.
//!
//! Usage:
//!   vigil start   --config-dir /etc/vigil
//!   vigil stop    --config-dir /etc/vigil
//!   vigil status  --config-dir /etc/vigil
//!   vigil restart --config-dir /etc/vigil

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use vigil_core::service;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_ALREADY_RUNNING: i32 = 2;

#[derive(Parser)]
#[command(name = "vigil", about = "Restaurant multi-camera surveillance orchestration core", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the service in the foreground; refuses if already running.
    Start {
        #[arg(long, default_value = "/etc/vigil")]
        config_dir: PathBuf,
    },
    /// Send a polite stop to a running instance.
    Stop {
        #[arg(long, default_value = "/etc/vigil")]
        config_dir: PathBuf,
    },
    /// Print one-line status: pid, current capture window, current processing window.
    Status {
        #[arg(long, default_value = "/etc/vigil")]
        config_dir: PathBuf,
    },
    /// Stop then start.
    Restart {
        #[arg(long, default_value = "/etc/vigil")]
        config_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Start { config_dir } => run_start(config_dir).await,
        Command::Stop { config_dir } => run_stop(config_dir),
        Command::Status { config_dir } => run_status(config_dir),
        Command::Restart { config_dir } => {
            run_stop(config_dir.clone());
            run_start(config_dir).await
        }
    };

    std::process::exit(code);
}

async fn run_start(config_dir: PathBuf) -> i32 {
    match service::start(config_dir).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "failed to start");
            if e.to_string().contains("already running") {
                EXIT_ALREADY_RUNNING
            } else {
                EXIT_FAILURE
            }
        }
    }
}

fn run_stop(config_dir: PathBuf) -> i32 {
    match service::stop(config_dir) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "failed to stop");
            EXIT_FAILURE
        }
    }
}

fn run_status(config_dir: PathBuf) -> i32 {
    match service::status(config_dir) {
        Ok(line) => {
            println!("{line}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_FAILURE
        }
    }
}
