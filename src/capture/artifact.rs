use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::config::Viewport;

/// Run-level listing of every crawled path, one per line
pub const URL_PATHS_FILE: &str = "url_paths.txt";

/// Run statistics written next to the artifacts
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Filesystem-safe artifact name of a URL path: every character outside
/// `[A-Za-z0-9._-]` becomes `_`, so `/` maps to `_`
pub fn artifact_name(url_path: &str) -> String {
    url_path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Artifact file set of one page inside one run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir: PathBuf,
    name: String,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.name, suffix))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_log(&self) -> PathBuf {
        self.file("run.log")
    }

    pub fn run_png(&self) -> PathBuf {
        self.file("run.png")
    }

    pub fn config_js(&self) -> PathBuf {
        self.file("config.js")
    }

    pub fn ref_log(&self) -> PathBuf {
        self.file("ref.log")
    }

    pub fn ref_png(&self) -> PathBuf {
        self.file("ref.png")
    }

    pub fn diff_png(&self) -> PathBuf {
        self.file("diff.png")
    }

    pub fn diff_log(&self) -> PathBuf {
        self.file("diff.log")
    }
}

/// Capture descriptor handed to the render tool as `<name>_config.js`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    pub target_url: String,
    pub output_path: PathBuf,
    pub viewport_size: Viewport,
    pub resource_timeout_ms: u64,
    pub user_agent: String,
}

impl CaptureConfig {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .context("Failed to serialize capture config")?;
        tokio::fs::write(path, contents)
            .await
            .context(format!("Failed to write capture config: {}", path.display()))
    }
}

/// Write the ordered path listing of a run
pub async fn write_url_paths(dir: &Path, paths: &[String]) -> Result<()> {
    let mut contents = paths.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    let path = dir.join(URL_PATHS_FILE);
    tokio::fs::write(&path, contents)
        .await
        .context(format!("Failed to write {}", path.display()))
}

/// Read the path listing of an earlier run; a missing listing reads as empty
pub async fn read_url_paths(dir: &Path) -> Result<Vec<String>> {
    let path = dir.join(URL_PATHS_FILE);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(vec![]);
    }

    let contents = tokio::fs::read_to_string(&path)
        .await
        .context(format!("Failed to read {}", path.display()))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
