//! imagebuild job queue CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use imagebuild_core::JobId;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "imagebuild")]
#[command(about = "Inspect and operate the imagebuild job queue", long_about = None)]
struct Cli {
    /// Configuration file (KDL)
    #[arg(long, short, env = "IMAGEBUILD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the queue
    Enqueue {
        /// Job type
        #[arg(long = "type")]
        job_type: String,
        /// Arguments as JSON
        #[arg(long, default_value = "null")]
        args: String,
        /// Job that must finish first (repeatable)
        #[arg(long = "dep")]
        dependencies: Vec<JobId>,
        /// Channel the job is routed to
        #[arg(long, default_value = "")]
        channel: String,
    },
    /// Show the status of a job
    Status {
        /// Job ID
        id: JobId,
    },
    /// Cancel a pending or running job
    Cancel {
        /// Job ID
        id: JobId,
    },
    /// List job IDs
    Jobs {
        /// Only jobs no other job depends on
        #[arg(long)]
        roots: bool,
    },
    /// List workers not seen for a while
    Workers {
        #[arg(long, default_value_t = 0)]
        older_than_secs: u64,
    },
    /// List delivery tokens whose heartbeat is older than a threshold
    Heartbeats {
        #[arg(long, default_value_t = 0)]
        older_than_secs: u64,
    },
    /// Reclaim stalled jobs and prune idle workers until interrupted
    Supervise,
}

impl Commands {
    /// Commands that read the live state of the running service.
    fn live_state(&self) -> Option<&'static str> {
        match self {
            Commands::Workers { .. } => Some("workers"),
            Commands::Heartbeats { .. } => Some("heartbeats"),
            Commands::Supervise => Some("supervise"),
            _ => None,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = commands::load(cli.config.as_deref())?;
    if let Some(command) = cli.command.live_state() {
        commands::require_shared(&config.queue, command)?;
    }
    let queue = commands::open_queue(&config).await?;

    match cli.command {
        Commands::Enqueue {
            job_type,
            args,
            dependencies,
            channel,
        } => {
            commands::jobs::enqueue(queue.as_ref(), &job_type, &args, &dependencies, &channel)
                .await?;
        }
        Commands::Status { id } => {
            commands::jobs::status(queue.as_ref(), id).await?;
        }
        Commands::Cancel { id } => {
            commands::jobs::cancel(queue.as_ref(), id).await?;
        }
        Commands::Jobs { roots } => {
            commands::jobs::list(queue.as_ref(), roots).await?;
        }
        Commands::Workers { older_than_secs } => {
            commands::workers::list(queue.as_ref(), older_than_secs).await?;
        }
        Commands::Heartbeats { older_than_secs } => {
            commands::workers::heartbeats(queue.as_ref(), older_than_secs).await?;
        }
        Commands::Supervise => {
            commands::supervise(queue, config.supervisor).await?;
        }
    }

    Ok(())
}
