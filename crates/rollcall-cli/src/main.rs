//! Rollcall operator CLI.

use clap::{Parser, Subcommand};

mod commands;

use commands::ApiClient;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Rollcall job subsystem CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "ROLLCALL_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and control jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Reconcile interrupted jobs with the queue
    Recover,
    /// Show worker pool and queue status
    Workers,
    /// Validate a system configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(default_value = "rollcall.kdl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Show one job
    Show {
        /// Job ID
        id: String,
    },
    /// List jobs
    List {
        /// Comma separated statuses
        #[arg(long)]
        status: Option<String>,
        /// Job type
        #[arg(long = "type")]
        job_type: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Pause a pending or running job
    Pause { id: String },
    /// Resume a paused job
    Resume { id: String },
    /// Cancel a job
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::ValidateConfig { path } = &cli.command {
        return commands::validate_config(path);
    }

    let client = ApiClient::new(&cli.api_url)?;
    match cli.command {
        Commands::Jobs { command } => match command {
            JobCommands::Show { id } => commands::jobs::show(&client, &id).await?,
            JobCommands::List {
                status,
                job_type,
                limit,
            } => commands::jobs::list(&client, status, job_type, limit).await?,
            JobCommands::Pause { id } => commands::jobs::control(&client, &id, "pause").await?,
            JobCommands::Resume { id } => commands::jobs::control(&client, &id, "resume").await?,
            JobCommands::Cancel { id } => commands::jobs::control(&client, &id, "cancel").await?,
        },
        Commands::Recover => commands::recover(&client).await?,
        Commands::Workers => commands::workers(&client).await?,
        Commands::ValidateConfig { .. } => {}
    }

    Ok(())
}
