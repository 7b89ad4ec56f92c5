use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::capture::artifact::{artifact_name, ArtifactPaths, CaptureConfig};
use crate::capture::diff::{ImageDiffer, SubprocessDiffer};
use crate::capture::fetch::{extract_links, PageFetcher};
use crate::capture::render::{Renderer, SubprocessRenderer};
use crate::cli::config::{CaptureSettings, SiteDiffConfig, Viewport};
use crate::crawler::canonical::url_path;
use crate::crawler::task::{CaptureOutcome, CaptureRequest, DiffOutcome, DiffRequest, TaskError};
use crate::queue::coordinator::{HandlerRegistry, WorkHandler};
use crate::queue::item::{WorkKind, WorkOutput, WorkPayload, WorkResult};

/// Registry with the subprocess-backed capture and diff handlers
pub fn build_registry(config: &SiteDiffConfig) -> anyhow::Result<HandlerRegistry> {
    let fetcher = PageFetcher::new(&config.crawler)?;
    let renderer = Arc::new(SubprocessRenderer::new(&config.capture));
    let differ = Arc::new(SubprocessDiffer::new(&config.diff));

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            WorkKind::Capture,
            Arc::new(CaptureHandler::new(fetcher, renderer, &config.capture, &config.crawler.user_agent)),
        )
        .register(WorkKind::Diff, Arc::new(DiffHandler::new(differ)));

    Ok(registry)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Delete an artifact left behind by an earlier attempt or run
async fn remove_stale(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> TaskError {
    TaskError::Terminal(format!("failed to {} {}: {}", action, path.display(), e))
}

async fn write_log(path: &Path, contents: &str) -> Result<(), TaskError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| io_failure("write", path, e))
}

/// Append to a log the tool may already have written
async fn append_log(path: &Path, contents: &str) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;

    let written = match file {
        Ok(mut file) => file.write_all(contents.as_bytes()).await,
        Err(e) => Err(e),
    };

    if let Err(e) = written {
        warn!("Failed to write {}: {}", path.display(), e);
    }
}

/// Fetches a page, renders it and chains a diff when a reference exists
pub struct CaptureHandler {
    fetcher: PageFetcher,
    renderer: Arc<dyn Renderer>,
    viewport: Viewport,
    resource_timeout_ms: u64,
    user_agent: String,
}

impl CaptureHandler {
    pub fn new(fetcher: PageFetcher, renderer: Arc<dyn Renderer>, settings: &CaptureSettings, user_agent: &str) -> Self {
        Self {
            fetcher,
            renderer,
            viewport: settings.viewport,
            resource_timeout_ms: settings.resource_timeout_ms,
            user_agent: user_agent.to_string(),
        }
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<WorkOutput, TaskError> {
        let path = url_path(&request.url);
        let paths = ArtifactPaths::new(&request.output_dir, &artifact_name(&path));

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| io_failure("create", &request.output_dir, e))?;

        match self.attempt(request, &path, &paths).await {
            Ok(output) => Ok(output),
            Err(e) => {
                // Failed attempts leave an error-bearing log and no screenshot
                remove_stale(&paths.run_png()).await;
                append_log(
                    &paths.run_log(),
                    &format!("{} capture of {} failed: {}\n", Utc::now().to_rfc3339(), request.url, e),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn attempt(&self, request: &CaptureRequest, path: &str, paths: &ArtifactPaths) -> Result<WorkOutput, TaskError> {
        remove_stale(&paths.run_png()).await;
        remove_stale(&paths.run_log()).await;

        let config = CaptureConfig {
            target_url: request.url.clone(),
            output_path: paths.run_png(),
            viewport_size: self.viewport,
            resource_timeout_ms: self.resource_timeout_ms,
            user_agent: self.user_agent.clone(),
        };
        config
            .write(&paths.config_js())
            .await
            .map_err(|e| TaskError::Terminal(format!("{:#}", e)))?;

        let page = self.fetcher.fetch(&request.url).await?;
        let links = if page.is_html() {
            extract_links(&page.body)
        } else {
            debug!("Not following links of {} ({})", request.url, page.content_type);
            vec![]
        };

        self.renderer
            .render(&paths.config_js(), &paths.run_png(), &paths.run_log())
            .await?;

        info!("Captured {} -> {}", request.url, paths.run_png().display());

        let mut output = WorkOutput::new(WorkResult::Captured(CaptureOutcome {
            url: request.url.clone(),
            status_code: page.status,
            content_type: page.content_type,
            final_url: page.final_url,
            links,
            screenshot: paths.run_png(),
            captured_at: Utc::now(),
        }));

        if let Some(reference_dir) = &request.reference_dir {
            let reference = ArtifactPaths::new(reference_dir, paths.name());
            if exists(&reference.run_png()).await {
                output = output.with_follow_up(WorkPayload::Diff(DiffRequest {
                    name: paths.name().to_string(),
                    url_path: path.to_string(),
                    run_dir: request.output_dir.clone(),
                    reference_dir: reference_dir.clone(),
                }));
            } else {
                debug!("No reference capture for {}, nothing to diff", path);
            }
        }

        Ok(output)
    }
}

#[async_trait]
impl WorkHandler for CaptureHandler {
    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutput, TaskError> {
        match payload {
            WorkPayload::Capture(request) => self.capture(request).await,
            other => Err(TaskError::Terminal(format!("capture handler received a {} item", other.kind()))),
        }
    }
}

/// Compares a run capture against the reference capture of the same page
pub struct DiffHandler {
    differ: Arc<dyn ImageDiffer>,
}

impl DiffHandler {
    pub fn new(differ: Arc<dyn ImageDiffer>) -> Self {
        Self { differ }
    }

    async fn diff(&self, request: &DiffRequest) -> Result<WorkOutput, TaskError> {
        let run = ArtifactPaths::new(&request.run_dir, &request.name);
        let reference = ArtifactPaths::new(&request.reference_dir, &request.name);

        if !exists(&reference.run_png()).await {
            return Err(TaskError::Terminal(format!(
                "no reference capture of {} in {}",
                request.url_path,
                request.reference_dir.display()
            )));
        }

        tokio::fs::create_dir_all(&request.run_dir)
            .await
            .map_err(|e| io_failure("create", &request.run_dir, e))?;

        tokio::fs::copy(reference.run_png(), run.ref_png())
            .await
            .map_err(|e| io_failure("copy", &reference.run_png(), e))?;
        if exists(&reference.run_log()).await {
            tokio::fs::copy(reference.run_log(), run.ref_log())
                .await
                .map_err(|e| io_failure("copy", &reference.run_log(), e))?;
        } else {
            write_log(&run.ref_log(), "reference run left no log\n").await?;
        }

        remove_stale(&run.diff_png()).await;

        if !exists(&run.run_png()).await {
            write_log(
                &run.diff_log(),
                &format!(
                    "page removed: {} was captured in {} but not in this run\n",
                    request.url_path,
                    request.reference_dir.display()
                ),
            )
            .await?;
            return Err(TaskError::RemovedPage(request.url_path.clone()));
        }

        let verdict = match self.differ.compare(&run.run_png(), &run.ref_png(), &run.diff_png()).await {
            Ok(verdict) => verdict,
            Err(e) => {
                write_log(&run.diff_log(), &format!("diff of {} failed: {}\n", request.url_path, e)).await?;
                return Err(e);
            }
        };

        let diff_image = if verdict.differs {
            info!("{} differs from the reference", request.url_path);
            write_log(&run.diff_log(), &format!("difference found\n{}", verdict.report)).await?;
            exists(&run.diff_png()).await.then(|| run.diff_png())
        } else {
            debug!("{} matches the reference", request.url_path);
            remove_stale(&run.diff_png()).await;
            write_log(&run.diff_log(), &format!("no difference\n{}", verdict.report)).await?;
            None
        };

        Ok(WorkOutput::new(WorkResult::Diffed(DiffOutcome {
            name: request.name.clone(),
            url_path: request.url_path.clone(),
            differs: verdict.differs,
            diff_image,
            diff_log: run.diff_log(),
        })))
    }
}

#[async_trait]
impl WorkHandler for DiffHandler {
    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutput, TaskError> {
        match payload {
            WorkPayload::Diff(request) => self.diff(request).await,
            other => Err(TaskError::Terminal(format!("diff handler received a {} item", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::render::MockRenderer;
    use crate::capture::testing::BytesDiffer;
    use crate::cli::config::CrawlerSettings;
    use std::path::PathBuf;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capture_handler(renderer: MockRenderer) -> CaptureHandler {
        CaptureHandler::new(
            PageFetcher::new(&CrawlerSettings::default()).unwrap(),
            Arc::new(renderer),
            &CaptureSettings::default(),
            "site-diff-test",
        )
    }

    fn writing_renderer() -> MockRenderer {
        let mut renderer = MockRenderer::new();
        renderer.expect_render().returning(|_, screenshot, log| {
            std::fs::write(screenshot, b"png").unwrap();
            std::fs::write(log, b"ok").unwrap();
            Ok(())
        });
        renderer
    }

    async fn site() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<a href='/stuff'>x</a>", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/plain"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<a href='/hidden'>x</a>", "text/plain"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_raw("Nope", "text/plain"))
            .mount(&server)
            .await;
        server
    }

    fn request(url: String, output_dir: &Path, reference_dir: Option<PathBuf>) -> WorkPayload {
        WorkPayload::Capture(CaptureRequest {
            url,
            output_dir: output_dir.to_path_buf(),
            reference_dir,
        })
    }

    #[tokio::test]
    async fn test_capture_writes_artifacts_and_links() {
        let server = site().await;
        let out = tempfile::tempdir().unwrap();
        let handler = capture_handler(writing_renderer());

        let output = handler
            .execute(&request(format!("{}/", server.uri()), out.path(), None))
            .await
            .unwrap();

        assert!(out.path().join("__run.png").exists());
        assert!(out.path().join("__run.log").exists());
        assert!(out.path().join("__config.js").exists());
        assert!(output.follow_ups.is_empty());
        match output.result {
            WorkResult::Captured(outcome) => assert_eq!(outcome.links, vec!["/stuff"]),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_html_links_are_not_reported() {
        let server = site().await;
        let out = tempfile::tempdir().unwrap();
        let handler = capture_handler(writing_renderer());

        let output = handler
            .execute(&request(format!("{}/plain", server.uri()), out.path(), None))
            .await
            .unwrap();
        match output.result {
            WorkResult::Captured(outcome) => {
                assert!(outcome.links.is_empty());
                assert_eq!(outcome.content_type, "text/plain");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_leaves_error_log() {
        let server = site().await;
        let out = tempfile::tempdir().unwrap();
        let mut renderer = MockRenderer::new();
        renderer.expect_render().never();
        let handler = capture_handler(renderer);

        let result = handler
            .execute(&request(format!("{}/missing", server.uri()), out.path(), None))
            .await;

        assert!(matches!(result, Err(TaskError::Terminal(_))));
        assert!(!out.path().join("_missing_run.png").exists());
        let log = std::fs::read_to_string(out.path().join("_missing_run.log")).unwrap();
        assert!(log.contains("404"));
    }

    #[tokio::test]
    async fn test_render_failure_is_retryable() {
        let server = site().await;
        let out = tempfile::tempdir().unwrap();
        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .times(1)
            .returning(|_, _, _| Err(TaskError::Retryable("renderer timed out".into())));
        let handler = capture_handler(renderer);

        let result = handler
            .execute(&request(format!("{}/", server.uri()), out.path(), None))
            .await;
        assert_eq!(result, Err(TaskError::Retryable("renderer timed out".into())));
        assert!(std::fs::read_to_string(out.path().join("__run.log"))
            .unwrap()
            .contains("renderer timed out"));
    }

    #[tokio::test]
    async fn test_reference_capture_chains_diff() {
        let server = site().await;
        let out = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        std::fs::write(reference.path().join("__run.png"), b"png").unwrap();
        let handler = capture_handler(writing_renderer());

        let output = handler
            .execute(&request(
                format!("{}/", server.uri()),
                out.path(),
                Some(reference.path().to_path_buf()),
            ))
            .await
            .unwrap();

        assert_eq!(
            output.follow_ups,
            vec![WorkPayload::Diff(DiffRequest {
                name: "_".to_string(),
                url_path: "/".to_string(),
                run_dir: out.path().to_path_buf(),
                reference_dir: reference.path().to_path_buf(),
            })]
        );
    }

    fn diff_request(run: &Path, reference: &Path) -> WorkPayload {
        WorkPayload::Diff(DiffRequest {
            name: "_".to_string(),
            url_path: "/".to_string(),
            run_dir: run.to_path_buf(),
            reference_dir: reference.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_identical_captures_leave_no_diff_image() {
        let run = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        std::fs::write(run.path().join("__run.png"), b"same").unwrap();
        std::fs::write(reference.path().join("__run.png"), b"same").unwrap();
        std::fs::write(reference.path().join("__run.log"), b"log").unwrap();

        let output = DiffHandler::new(Arc::new(BytesDiffer))
            .execute(&diff_request(run.path(), reference.path()))
            .await
            .unwrap();

        assert!(run.path().join("__ref.png").exists());
        assert!(run.path().join("__ref.log").exists());
        assert!(!run.path().join("__diff.png").exists());
        let log = std::fs::read_to_string(run.path().join("__diff.log")).unwrap();
        assert!(log.starts_with("no difference"));
        assert!(matches!(output.result, WorkResult::Diffed(DiffOutcome { differs: false, .. })));
    }

    #[tokio::test]
    async fn test_changed_capture_writes_diff_image() {
        let run = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        std::fs::write(run.path().join("__run.png"), b"new").unwrap();
        std::fs::write(reference.path().join("__run.png"), b"old").unwrap();

        let output = DiffHandler::new(Arc::new(BytesDiffer))
            .execute(&diff_request(run.path(), reference.path()))
            .await
            .unwrap();

        assert!(run.path().join("__diff.png").exists());
        assert!(run.path().join("__diff.log").exists());
        match output.result {
            WorkResult::Diffed(outcome) => {
                assert!(outcome.differs);
                assert_eq!(outcome.diff_image, Some(run.path().join("__diff.png")));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_run_capture_is_removed_page() {
        let run = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        std::fs::write(reference.path().join("__run.png"), b"old").unwrap();

        let result = DiffHandler::new(Arc::new(BytesDiffer))
            .execute(&diff_request(run.path(), reference.path()))
            .await;

        assert_eq!(result, Err(TaskError::RemovedPage("/".to_string())));
        let log = std::fs::read_to_string(run.path().join("__diff.log")).unwrap();
        assert!(log.contains("page removed"));
        assert!(!run.path().join("__diff.png").exists());
    }
}
