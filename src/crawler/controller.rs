use anyhow::{Result, Context};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::artifact::{artifact_name, read_url_paths, write_url_paths, ArtifactPaths, RUN_SUMMARY_FILE};
use crate::capture::fetch::PageFetcher;
use crate::cli::config::{QueueMode, SiteDiffConfig};
use crate::crawler::canonical::{canonicalize, url_path};
use crate::crawler::frontier::CrawlState;
use crate::crawler::task::{CaptureRequest, DiffRequest, TaskError};
use crate::queue::coordinator::{Completions, Coordinator, HandlerRegistry};
use crate::queue::item::{WorkItem, WorkKind, WorkPayload, WorkResult, WorkState};
use crate::queue::server::QueueServer;
use crate::utils::metrics::{Metrics, MetricsCollector};

/// Errors that abort a run before any artifact is produced
#[derive(Debug, Error)]
pub enum SiteDiffError {
    #[error("invalid start URL: {0}")]
    InvalidStartUrl(String),

    #[error("start URL {url} is unreachable: {reason}")]
    StartUnreachable { url: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// One end-to-end run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub start_url: String,

    /// Directory receiving this run's artifacts
    pub output_dir: PathBuf,

    /// Earlier run to diff against
    pub reference_dir: Option<PathBuf>,

    /// Added to `crawler.ignore_prefixes` of the configuration
    pub ignore_prefixes: Vec<String>,
}

/// Crawl, capture and diff driver
pub struct SiteDiff {
    config: SiteDiffConfig,
    registry: HandlerRegistry,

    /// Externally supplied coordinator; a private one is started otherwise
    coordinator: Option<Coordinator>,
}

impl SiteDiff {
    pub fn new(config: SiteDiffConfig, registry: HandlerRegistry) -> Self {
        Self {
            config,
            registry,
            coordinator: None,
        }
    }

    /// Run on `coordinator` instead of starting a private one
    pub fn with_coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Crawl the site from `request.start_url`, capture every page, diff
    /// against the reference run and write the run artifacts
    pub async fn run(&self, request: RunRequest) -> Result<Metrics> {
        let start_url = canonicalize(&request.start_url, &request.start_url)
            .ok_or_else(|| SiteDiffError::InvalidStartUrl(request.start_url.clone()))?;

        let mut crawler_settings = self.config.crawler.clone();
        crawler_settings.ignore_prefixes.extend(request.ignore_prefixes.iter().cloned());
        let mut crawl = CrawlState::new(&start_url, &crawler_settings)
            .ok_or_else(|| SiteDiffError::InvalidStartUrl(start_url.clone()))?;

        if self.coordinator.is_none() && self.registry.handler(WorkKind::Capture).is_none() {
            return Err(SiteDiffError::Configuration("no capture handler registered".to_string()).into());
        }

        self.preflight(&start_url).await?;

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .context(format!("Failed to create output directory: {}", request.output_dir.display()))?;

        let reference_paths = match &request.reference_dir {
            Some(dir) => read_url_paths(dir).await?,
            None => vec![],
        };

        let (coordinator, owned) = match &self.coordinator {
            Some(coordinator) => (coordinator.clone(), false),
            None => (Coordinator::start(self.config.coordinator.clone(), self.registry.clone()), true),
        };

        let Some(completions) = coordinator.take_completions() else {
            return Err(SiteDiffError::Configuration("coordinator is already driving another run".to_string()).into());
        };

        let server = if self.config.queue.mode == QueueMode::Remote {
            let server = QueueServer::spawn(coordinator.clone(), &self.config.queue).await?;
            info!("Remote workers can join with --queue-url {}", server.base_url());
            Some(server)
        } else {
            None
        };

        info!("Starting site diff of {} into {}", start_url, request.output_dir.display());

        let metrics = MetricsCollector::new(&start_url);
        let mut run = Run {
            coordinator: &coordinator,
            completions,
            metrics: &metrics,
            output_dir: &request.output_dir,
            reference_dir: request.reference_dir.as_deref(),
            captures: HashSet::new(),
            links: HashMap::new(),
            failed_paths: Vec::new(),
            cursor: 0,
        };

        crawl.seed(&start_url);
        let outcome = run.crawl(&mut crawl).await;
        let outcome = match outcome {
            Ok(()) => run.diff_removed_pages(&crawl, &reference_paths).await,
            Err(e) => Err(e),
        };

        // The listing is written even when the run broke off
        let discovered = crawl.discovered_paths();
        let listing = write_url_paths(&request.output_dir, &discovered).await;

        if let Some(server) = server {
            server.shutdown();
        }
        if owned {
            coordinator.shutdown().await;
        }

        outcome?;
        listing?;

        metrics.set_pages_discovered(discovered.len()).await;
        let summary = metrics.finish().await;
        write_summary(&request.output_dir, &summary).await?;

        info!(
            "Run finished in {} ms: {} pages, {} captured, {} changed, {} removed, {} failed",
            summary.duration_ms(),
            summary.pages_discovered,
            summary.captures,
            summary.changed_pages.len(),
            summary.removed_pages.len(),
            summary.failures.len()
        );

        Ok(summary)
    }

    /// The start URL must answer at all; its status is judged by the capture
    async fn preflight(&self, start_url: &str) -> Result<()> {
        let fetcher = PageFetcher::new(&self.config.crawler)?;
        match fetcher.probe(start_url).await {
            Ok(status) => {
                debug!("Start URL {} answered {}", start_url, status);
                Ok(())
            }
            Err(reason) => Err(SiteDiffError::StartUnreachable {
                url: start_url.to_string(),
                reason,
            }
            .into()),
        }
    }
}

async fn write_summary(dir: &Path, summary: &Metrics) -> Result<()> {
    let path = dir.join(RUN_SUMMARY_FILE);
    let contents = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
    tokio::fs::write(&path, contents)
        .await
        .context(format!("Failed to write {}", path.display()))
}

/// Bookkeeping of one run in progress
struct Run<'a> {
    coordinator: &'a Coordinator,
    completions: Completions,
    metrics: &'a MetricsCollector,
    output_dir: &'a Path,
    reference_dir: Option<&'a Path>,

    /// Capture items still outstanding
    captures: HashSet<Uuid>,

    /// Links of settled captures not yet expanded, by requested URL
    links: HashMap<String, PageLinks>,

    /// Paths whose capture failed for good
    failed_paths: Vec<String>,

    /// Index of the next discovered URL to expand
    cursor: usize,
}

/// Raw hrefs of a page and the URL they resolve against
struct PageLinks {
    base: String,
    hrefs: Vec<String>,
}

impl Run<'_> {
    /// Capture pages until the frontier is exhausted and every capture settled
    async fn crawl(&mut self, crawl: &mut CrawlState) -> Result<()> {
        loop {
            while let Some(url) = crawl.next() {
                let payload = WorkPayload::Capture(CaptureRequest {
                    url,
                    output_dir: self.output_dir.to_path_buf(),
                    reference_dir: self.reference_dir.map(Path::to_path_buf),
                });
                let id = self.coordinator.submit(payload).await;
                self.captures.insert(id);
            }

            if self.captures.is_empty() {
                return Ok(());
            }

            let Some(item) = self.completions.recv().await else {
                anyhow::bail!("coordinator stopped before the crawl finished");
            };
            self.settle(item).await;
            self.expand(crawl);
        }
    }

    /// Feed links back into the frontier in discovery order: the k-th URL is
    /// expanded only after URLs 0..k, so the listing matches a sequential
    /// breadth-first crawl
    fn expand(&mut self, crawl: &mut CrawlState) {
        while let Some(url) = crawl.discovered().get(self.cursor).cloned() {
            let Some(links) = self.links.remove(&url) else {
                break;
            };
            for href in &links.hrefs {
                crawl.enqueue(&links.base, href);
            }
            self.cursor += 1;
        }
    }

    async fn settle(&mut self, item: WorkItem) {
        match &item.payload {
            WorkPayload::Capture(request) => {
                if !self.captures.remove(&item.id) {
                    debug!("Ignoring capture {} of another run", item.id);
                    return;
                }
                let links = self.settle_capture(request, &item).await;
                self.links.insert(request.url.clone(), links);
            }
            WorkPayload::Diff(request) => {
                if request.run_dir.as_path() != self.output_dir {
                    debug!("Ignoring diff {} of another run", item.id);
                    return;
                }
                self.settle_diff(request, &item).await;
            }
        }
    }

    /// Record a settled capture and return the links it contributes
    async fn settle_capture(&mut self, request: &CaptureRequest, item: &WorkItem) -> PageLinks {
        let path = url_path(&request.url);

        match (&item.state, &item.result) {
            (WorkState::Done, Some(WorkResult::Captured(outcome))) => {
                self.metrics.record_capture(outcome.status_code, item.attempts).await;
                PageLinks {
                    base: outcome.final_url.clone(),
                    hrefs: outcome.links.clone(),
                }
            }
            _ => {
                let error = item
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::Terminal("capture ended without a result".to_string()));
                warn!("Capture of {} failed after {} attempt(s): {}", request.url, item.attempts, error);
                self.metrics.record_capture_failure(&path, error, item.attempts).await;
                self.failed_paths.push(path);
                PageLinks {
                    base: request.url.clone(),
                    hrefs: vec![],
                }
            }
        }
    }

    async fn settle_diff(&mut self, request: &DiffRequest, item: &WorkItem) {
        match (&item.state, &item.result) {
            (WorkState::Done, Some(WorkResult::Diffed(outcome))) => self.metrics.record_diff(outcome).await,
            _ => {
                let error = item
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::Terminal("diff ended without a result".to_string()));
                match &error {
                    TaskError::RemovedPage(_) => warn!("{} is gone from the site", request.url_path),
                    other => warn!("Diff of {} failed: {}", request.url_path, other),
                }
                self.metrics
                    .record_diff_failure(&request.url_path, error, item.attempts)
                    .await;
            }
        }
    }

    /// Diff every reference page this run did not capture, so it surfaces as
    /// removed, then wait for all outstanding diffs
    async fn diff_removed_pages(&mut self, crawl: &CrawlState, reference_paths: &[String]) -> Result<()> {
        if let Some(reference_dir) = self.reference_dir {
            let crawled: HashSet<String> = crawl.discovered_paths().into_iter().collect();
            let failed: HashSet<&String> = self.failed_paths.iter().collect();

            for path in reference_paths {
                if crawled.contains(path) && !failed.contains(path) {
                    continue;
                }
                let name = artifact_name(path);
                let reference = ArtifactPaths::new(reference_dir, &name);
                if !tokio::fs::try_exists(reference.run_png()).await.unwrap_or(false) {
                    continue;
                }

                debug!("Reference page {} was not captured in this run", path);
                self.coordinator
                    .submit(WorkPayload::Diff(DiffRequest {
                        name,
                        url_path: path.clone(),
                        run_dir: self.output_dir.to_path_buf(),
                        reference_dir: reference_dir.to_path_buf(),
                    }))
                    .await;
            }
        }

        self.coordinator.wait_all().await;
        while let Some(item) = self.completions.try_recv() {
            self.settle(item).await;
        }

        Ok(())
    }
}
