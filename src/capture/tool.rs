use std::ffi::OsString;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::crawler::task::TaskError;

/// Captured result of an external tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code; `None` when the process died from a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Log text recorded next to the artifacts
    pub fn transcript(&self, program: &str) -> String {
        let exit = self
            .code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());

        format!(
            "$ {}\nexit: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
            program, exit, self.stdout, self.stderr
        )
    }
}

/// Run `program` to completion under `timeout`. The child is killed when the
/// timeout fires. A timeout is retryable; a missing binary is not.
pub async fn run_tool(program: &str, args: &[OsString], timeout: Duration) -> Result<ToolOutput, TaskError> {
    debug!("Running {} {:?}", program, args);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            TaskError::Terminal(format!("cannot execute {}: {}", program, e))
        }
        _ => TaskError::Retryable(format!("failed to start {}: {}", program, e)),
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(TaskError::Retryable(format!("{} failed: {}", program, e))),
        Err(_) => {
            return Err(TaskError::Retryable(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs_f64()
            )))
        }
    };

    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let output = run_tool("sh", &args(&["-c", "echo out; echo err >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(output.transcript("sh").contains("exit: 3"));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let result = run_tool("sh", &args(&["-c", "sleep 5"]), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TaskError::Retryable(_))));
    }

    #[tokio::test]
    async fn test_missing_binary_is_terminal() {
        let result = run_tool("/nonexistent/site-diff-renderer", &[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TaskError::Terminal(_))));
    }
}
