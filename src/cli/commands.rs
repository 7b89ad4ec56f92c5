use anyhow::{Result, Context};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::capture::handlers::build_registry;
use crate::cli::config::{QueueMode, SiteDiffConfig};
use crate::cli::RunArgs;
use crate::crawler::controller::{RunRequest, SiteDiff};
use crate::queue::client::{default_worker_id, QueueClient, RemoteWorker};
use crate::queue::coordinator::HandlerRegistry;
use crate::queue::item::WorkKind;
use crate::utils::metrics::Metrics;

/// Configuration from `--config`, a site profile or the default file
fn load_config(config_path: Option<PathBuf>, profile: Option<&str>) -> Result<SiteDiffConfig> {
    match (config_path, profile) {
        (Some(path), _) => SiteDiffConfig::load_from_file(&path),
        (None, Some(profile)) => {
            SiteDiffConfig::load_profile(profile).context(format!("Failed to load profile: {}", profile))
        }
        (None, None) => SiteDiffConfig::load_default(),
    }
}

/// Crawl, capture and diff one site
pub async fn run(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path, args.profile.as_deref())?;

    // Command line parameters override the configuration
    if let Some(workers) = args.workers {
        config.coordinator.workers = workers;
    }
    if args.remote {
        config.queue.mode = QueueMode::Remote;
    }
    config.validate()?;

    let registry = build_registry(&config)?;
    let site_diff = SiteDiff::new(config, registry);
    let summary = site_diff
        .run(RunRequest {
            start_url: args.url,
            output_dir: args.output.clone(),
            reference_dir: args.reference,
            ignore_prefixes: args.ignore,
        })
        .await?;

    print_summary(&summary, &args.output);
    Ok(())
}

fn print_summary(summary: &Metrics, output: &std::path::Path) {
    println!("Start URL: {}", summary.start_url);
    println!("Artifacts: {}", output.display());
    println!("Duration: {} ms", summary.duration_ms());
    println!("Pages: {} discovered, {} captured", summary.pages_discovered, summary.captures);
    println!("Unchanged: {}", summary.unchanged_pages.len());

    for (label, pages) in [("Changed", &summary.changed_pages), ("Removed", &summary.removed_pages)] {
        println!("{}: {}", label, pages.len());
        for page in pages {
            println!("  - {}", page);
        }
    }

    if !summary.failures.is_empty() {
        println!("Failures:");
        for failure in &summary.failures {
            println!("  - {} after {} attempt(s): {}", failure.url_path, failure.attempts, failure.error);
        }
    }
}

/// Handlers of `kinds` only; every kind when empty
fn select_kinds(registry: HandlerRegistry, kinds: &[WorkKind]) -> HandlerRegistry {
    if kinds.is_empty() {
        return registry;
    }

    let mut selected = HandlerRegistry::new();
    for kind in kinds {
        match registry.handler(*kind) {
            Some(handler) => {
                selected.register(*kind, handler.clone());
            }
            None => warn!("No handler for {} items", kind),
        }
    }
    selected
}

/// Lease and execute items from a remote coordinator until interrupted
pub async fn worker(
    queue_url: String,
    kinds: Vec<WorkKind>,
    worker_id: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path, None)?;
    let registry = select_kinds(build_registry(&config)?, &kinds);
    if registry.kinds().is_empty() {
        anyhow::bail!("worker has no work kinds to claim");
    }

    let client = QueueClient::new(&queue_url, Duration::from_millis(config.queue.poll_timeout_ms))?;
    let worker_id = worker_id.unwrap_or_else(default_worker_id);
    let worker = RemoteWorker::new(client, registry, worker_id, &config.queue);

    tokio::select! {
        _ = worker.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for interrupt")?;
            info!("Worker {} interrupted, leases in flight will expire", worker.worker_id());
        }
    }

    Ok(())
}

/// Print the queue counters of a running coordinator
pub async fn status(queue_url: String) -> Result<()> {
    let client = QueueClient::new(&queue_url, Duration::from_secs(5))?;
    let snapshot = client
        .status()
        .await
        .context(format!("Failed to query work queue at {}", queue_url))?;

    println!("Work queue: {}", queue_url);
    println!("Queued: {}", snapshot.queued);
    println!("Active: {} ({} leased)", snapshot.active, snapshot.leases);
    println!("Done: {}", snapshot.done);
    println!("Failed: {}", snapshot.failed);

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = SiteDiffConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    // Load the profile if it exists
    match SiteDiffConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            // Profile doesn't exist, create a new one
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let path = SiteDiffConfig::default().save_as_profile(&profile_name)?;
            println!("Created default profile: {}", path.display());
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, None)?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
