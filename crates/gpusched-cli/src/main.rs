//! gpusched CLI
//!
//! Command-line interface for interacting with the gpusched daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpusched - submit and inspect jobs on a GPU node
#[derive(Parser, Debug)]
#[command(name = "gpusched")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a script as a job
    Submit {
        /// Script to run
        script: PathBuf,

        /// Device memory required, in bytes or with a unit (e.g. 8G, 512MiB)
        #[arg(long, value_parser = commands::parse_size)]
        vram: u64,

        /// Partition
        #[arg(long, default_value = "normal")]
        partition: String,

        /// QoS class
        #[arg(long, default_value = "standard")]
        qos: String,

        /// Submitting user (defaults to $USER)
        #[arg(long)]
        user: Option<String>,
    },

    /// List jobs in queue order
    Queue {
        /// Only show jobs with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a job in detail
    Job {
        /// Job ID
        id: Uuid,
    },

    /// Show GPU devices
    Gpus,

    /// Print the output of a job
    Logs {
        /// Job ID
        id: Uuid,

        /// Keep printing output until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            script,
            vram,
            partition,
            qos,
            user,
        } => {
            commands::submit(&client, script, vram, partition, qos, user).await?;
        }
        Commands::Queue { status } => {
            commands::queue(&client, status).await?;
        }
        Commands::Job { id } => {
            commands::job(&client, id).await?;
        }
        Commands::Gpus => {
            commands::gpus(&client).await?;
        }
        Commands::Logs { id, follow } => {
            commands::logs(&client, id, follow).await?;
        }
    }

    Ok(())
}
