use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::capture::tool::run_tool;
use crate::cli::config::DiffSettings;
use crate::crawler::task::TaskError;

/// Answer of a pixel comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffVerdict {
    pub differs: bool,

    /// Tool output, recorded in the diff log
    pub report: String,
}

/// Compares two screenshots, writing a diff image when they differ
#[async_trait]
pub trait ImageDiffer: Send + Sync {
    async fn compare(&self, run: &Path, reference: &Path, diff: &Path) -> Result<DiffVerdict, TaskError>;
}

/// ImageMagick style `compare`: exit 0 means identical, 1 means different,
/// anything else is an error
pub struct SubprocessDiffer {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessDiffer {
    pub fn new(settings: &DiffSettings) -> Self {
        Self {
            binary: settings.diff_binary.clone(),
            args: settings.diff_args.clone(),
            timeout: Duration::from_secs(settings.diff_timeout_secs),
        }
    }
}

#[async_trait]
impl ImageDiffer for SubprocessDiffer {
    async fn compare(&self, run: &Path, reference: &Path, diff: &Path) -> Result<DiffVerdict, TaskError> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push(run.as_os_str().to_owned());
        args.push(reference.as_os_str().to_owned());
        args.push(diff.as_os_str().to_owned());

        let output = run_tool(&self.binary, &args, self.timeout).await?;
        let report = output.transcript(&self.binary);

        match output.code {
            Some(0) => Ok(DiffVerdict { differs: false, report }),
            Some(1) => Ok(DiffVerdict { differs: true, report }),
            Some(code) => Err(TaskError::Terminal(format!(
                "{} failed with status {}: {}",
                self.binary,
                code,
                output.stderr.trim()
            ))),
            None => Err(TaskError::Retryable(format!("{} was killed by a signal", self.binary))),
        }
    }
}
