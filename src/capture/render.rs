use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::capture::tool::run_tool;
use crate::cli::config::CaptureSettings;
use crate::crawler::task::TaskError;

/// Turns a capture descriptor into a screenshot
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render the page described by `config` into `screenshot`, recording
    /// the tool output in `log`
    async fn render(&self, config: &Path, screenshot: &Path, log: &Path) -> Result<(), TaskError>;
}

/// Runs the browser automation tool as
/// `<render_binary> <render_args>... <config> <screenshot>`
pub struct SubprocessRenderer {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessRenderer {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            binary: settings.render_binary.clone(),
            args: settings.render_args.clone(),
            timeout: Duration::from_secs(settings.render_timeout_secs),
        }
    }
}

#[async_trait]
impl Renderer for SubprocessRenderer {
    async fn render(&self, config: &Path, screenshot: &Path, log: &Path) -> Result<(), TaskError> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push(config.as_os_str().to_owned());
        args.push(screenshot.as_os_str().to_owned());

        let output = run_tool(&self.binary, &args, self.timeout).await?;

        if let Err(e) = tokio::fs::write(log, output.transcript(&self.binary)).await {
            warn!("Failed to write render log {}: {}", log.display(), e);
        }

        match output.code {
            Some(0) => {}
            Some(code) => {
                return Err(TaskError::Retryable(format!(
                    "{} exited with status {}: {}",
                    self.binary,
                    code,
                    output.stderr.trim()
                )))
            }
            None => return Err(TaskError::Retryable(format!("{} was killed by a signal", self.binary))),
        }

        if !tokio::fs::try_exists(screenshot).await.unwrap_or(false) {
            return Err(TaskError::Terminal(format!(
                "{} exited cleanly but wrote no screenshot to {}",
                self.binary,
                screenshot.display()
            )));
        }

        debug!("Rendered {}", screenshot.display());
        Ok(())
    }
}
