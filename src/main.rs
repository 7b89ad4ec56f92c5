use anyhow::Result;
use tracing::{info, error};

mod capture;
mod cli;
mod crawler;
mod queue;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    utils::init_logging(args.verbose, args.log_file.clone())?;

    info!("Starting site-diff v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
