pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::queue::item::WorkKind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file to use instead of the default one
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site, capture every page and diff against a reference run
    Run(RunArgs),

    /// Execute work items leased from a remote coordinator
    Worker {
        /// Base URL of the coordinator's work queue
        #[arg(long, required = true)]
        queue_url: String,

        /// Work kinds to claim; all kinds when omitted
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<WorkKind>,

        /// Worker identity reported to the coordinator
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Show the work queue of a running coordinator
    Status {
        /// Base URL of the coordinator's work queue
        #[arg(long, required = true)]
        queue_url: String,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// URL to start crawling from
    #[arg(required = true)]
    pub url: String,

    /// Directory receiving this run's artifacts
    #[arg(short, long, required = true)]
    pub output: PathBuf,

    /// Directory of an earlier run to diff against
    #[arg(short, long)]
    pub reference: Option<PathBuf>,

    /// Path prefix never to crawl (repeatable)
    #[arg(short, long = "ignore")]
    pub ignore: Vec<String>,

    /// Number of local workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Also serve the work queue to remote workers; local workers keep running
    #[arg(long)]
    pub remote: bool,

    /// Site profile to load the configuration from
    #[arg(short, long)]
    pub profile: Option<String>,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Commands::Run(args) => {
            info!("Starting run on {} into {}", args.url, args.output.display());
            commands::run(args, config_path).await
        }
        Commands::Worker { queue_url, kinds, worker_id } => {
            info!("Starting worker against {}", queue_url);
            commands::worker(queue_url, kinds, worker_id, config_path).await
        }
        Commands::Status { queue_url } => {
            info!("Checking work queue at {}", queue_url);
            commands::status(queue_url).await
        }
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config(config_path).await
            }
        }
    }
}
