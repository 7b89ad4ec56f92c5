use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, debug, error};

use crate::queue::item::WorkKind;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SiteDiffConfig {
    pub crawler: CrawlerSettings,
    pub capture: CaptureSettings,
    pub diff: DiffSettings,
    pub coordinator: CoordinatorSettings,
    pub queue: QueueSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Path prefixes (`/ignore`) or absolute URL prefixes never crawled
    pub ignore_prefixes: Vec<String>,

    /// Regular expressions; matching URLs are never crawled
    pub exclude_patterns: Vec<String>,

    /// Stop discovering new pages past this count
    pub max_pages: Option<usize>,

    /// Timeout of the HTTP fetch preceding every capture, in seconds
    pub fetch_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            ignore_prefixes: vec![],
            exclude_patterns: vec![],
            max_pages: None,
            fetch_timeout_secs: 30,
            user_agent: format!("site-diff/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Renderer viewport
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Page renderer settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureSettings {
    /// Browser automation binary
    pub render_binary: String,

    /// Arguments placed before the config and screenshot paths
    pub render_args: Vec<String>,

    /// Per-invocation timeout in seconds
    pub render_timeout_secs: u64,

    pub viewport: Viewport,

    /// Give up on a page resource after this many milliseconds
    pub resource_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            render_binary: "phantomjs".to_string(),
            render_args: vec!["capture.js".to_string()],
            render_timeout_secs: 120,
            viewport: Viewport {
                width: 1280,
                height: 1024,
            },
            resource_timeout_ms: 60_000,
        }
    }
}

/// Pixel diff tool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiffSettings {
    pub diff_binary: String,

    /// Arguments placed before the run, reference and diff image paths
    pub diff_args: Vec<String>,

    pub diff_timeout_secs: u64,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            diff_binary: "compare".to_string(),
            diff_args: vec!["-metric".to_string(), "AE".to_string()],
            diff_timeout_secs: 60,
        }
    }
}

/// Work coordinator settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Local worker slots
    pub workers: usize,

    /// Executions allowed per item before it is marked failed
    pub max_attempts: u32,

    /// Delay before a retried item becomes claimable again
    pub retry_backoff_ms: u64,

    /// Per-kind priority, higher first; kinds without an entry get 0
    pub priorities: HashMap<WorkKind, i32>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_backoff_ms: 1000,
            priorities: HashMap::new(),
        }
    }
}

/// Where items execute
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// In-process worker slots only
    #[default]
    Local,

    /// Also serve the work queue protocol to remote workers
    Remote,
}

/// Remote work queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub mode: QueueMode,

    /// Address the queue server binds in remote mode
    pub listen_addr: String,

    /// Lease duration granted on claim and on every heartbeat
    pub lease_ms: u64,

    /// How often a remote worker renews its lease
    pub heartbeat_interval_ms: u64,

    /// How often the server reclaims expired leases
    pub sweep_interval_ms: u64,

    /// Server-side long-poll window of a claim
    pub poll_timeout_ms: u64,

    /// Worker backoff bounds after an empty or failed claim
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Local,
            listen_addr: "127.0.0.1:7878".to_string(),
            lease_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            sweep_interval_ms: 1_000,
            poll_timeout_ms: 20_000,
            min_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

impl SiteDiffConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "site-diff", "site-diff") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Site profiles live next to the default configuration
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load a per-site profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file; missing sections take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as a per-site profile
    pub fn save_as_profile(&self, profile: &str) -> Result<PathBuf> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)?;
        Ok(profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available site profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();
        for entry in fs::read_dir(&sites_dir)
            .context(format!("Failed to list profiles in {}", sites_dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }

    /// Reject settings the run cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.max_attempts == 0 {
            anyhow::bail!("coordinator.max_attempts must be at least 1");
        }
        if self.queue.mode == QueueMode::Local && self.coordinator.workers == 0 {
            anyhow::bail!("coordinator.workers must be at least 1 in local mode");
        }
        if self.queue.heartbeat_interval_ms >= self.queue.lease_ms {
            anyhow::bail!(
                "queue.heartbeat_interval_ms ({}) must be shorter than queue.lease_ms ({})",
                self.queue.heartbeat_interval_ms,
                self.queue.lease_ms
            );
        }
        if self.queue.min_backoff_ms > self.queue.max_backoff_ms {
            anyhow::bail!("queue.min_backoff_ms must not exceed queue.max_backoff_ms");
        }
        Ok(())
    }
}
