//! Stand-ins for the external tools, shared by the handler and run tests

use async_trait::async_trait;
use std::path::Path;

use crate::capture::artifact::CaptureConfig;
use crate::capture::diff::{DiffVerdict, ImageDiffer};
use crate::capture::render::Renderer;
use crate::crawler::task::TaskError;

/// "Renders" a page by downloading it and saving the body as the screenshot
pub struct BodyRenderer;

#[async_trait]
impl Renderer for BodyRenderer {
    async fn render(&self, config: &Path, screenshot: &Path, log: &Path) -> Result<(), TaskError> {
        let raw = tokio::fs::read_to_string(config)
            .await
            .map_err(|e| TaskError::Terminal(e.to_string()))?;
        let config: CaptureConfig = serde_json::from_str(&raw).map_err(|e| TaskError::Terminal(e.to_string()))?;

        let body = reqwest::get(&config.target_url)
            .await
            .map_err(|e| TaskError::Retryable(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| TaskError::Retryable(e.to_string()))?;

        tokio::fs::write(screenshot, &body)
            .await
            .map_err(|e| TaskError::Terminal(e.to_string()))?;
        tokio::fs::write(log, format!("rendered {}\n", config.target_url))
            .await
            .map_err(|e| TaskError::Terminal(e.to_string()))
    }
}

/// Byte comparison standing in for the pixel diff tool
pub struct BytesDiffer;

#[async_trait]
impl ImageDiffer for BytesDiffer {
    async fn compare(&self, run: &Path, reference: &Path, diff: &Path) -> Result<DiffVerdict, TaskError> {
        let a = tokio::fs::read(run).await.map_err(|e| TaskError::Terminal(e.to_string()))?;
        let b = tokio::fs::read(reference).await.map_err(|e| TaskError::Terminal(e.to_string()))?;
        let differs = a != b;
        if differs {
            tokio::fs::write(diff, b"diff")
                .await
                .map_err(|e| TaskError::Terminal(e.to_string()))?;
        }
        Ok(DiffVerdict {
            differs,
            report: format!("{} vs {} bytes\n", a.len(), b.len()),
        })
    }
}
