use crate::error::{ExecutorError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const OUTPUT_BYTES_MAX: usize = 32_000;

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub working_directory: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs or hands off shell commands. `working_directory` is workspace-relative and
/// already validated.
#[async_trait]
pub trait TerminalRunner: Send + Sync {
    /// Puts the command in front of the human without running it.
    async fn surface(&self, command: &str, working_directory: &Path) -> Result<()>;

    async fn run_captured(&self, command: &str, working_directory: &Path) -> Result<CommandOutput>;
}

/// `/bin/sh -c` runner rooted at the workspace. Surfacing only logs the command.
pub struct ShellRunner {
    root_dir: PathBuf,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(root_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root_dir: root_dir.into(),
            timeout,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

#[async_trait]
impl TerminalRunner for ShellRunner {
    async fn surface(&self, command: &str, working_directory: &Path) -> Result<()> {
        tracing::info!(
            command,
            working_directory = %working_directory.display(),
            "command surfaced for manual run"
        );
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_captured(&self, command: &str, working_directory: &Path) -> Result<CommandOutput> {
        let cwd = self.root_dir.join(working_directory);
        if !tokio::fs::metadata(&cwd).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(ExecutorError::InvalidArguments(format!(
                "working directory does not exist: {}",
                working_directory.display()
            )));
        }

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("AGENTGATE_EXECUTION", "captured")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ExecutorError::ExecutionFailed(format!(
                    "command timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| ExecutorError::ExecutionFailed(e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(exit_code, "command finished");
        Ok(CommandOutput {
            stdout: truncate_output(&output.stdout),
            stderr: truncate_output(&output.stderr),
            exit_code,
            working_directory: working_directory.display().to_string(),
        })
    }
}

/// Accepts only relative directories inside the workspace.
pub fn validate_working_directory(requested: Option<&str>) -> Result<PathBuf> {
    let rel = Path::new(requested.unwrap_or("."));
    if rel.is_absolute() {
        return Err(ExecutorError::Unauthorized(
            "working_directory must be relative to the workspace".to_string(),
        ));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(ExecutorError::Unauthorized(
                    "path traversal is not allowed in working_directory".to_string(),
                ));
            }
            Component::CurDir | Component::Normal(_) => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecutorError::Unauthorized(
                    "invalid working_directory".to_string(),
                ));
            }
        }
    }
    Ok(rel.to_path_buf())
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= OUTPUT_BYTES_MAX {
        return text.into_owned();
    }
    let mut cut = OUTPUT_BYTES_MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_directory_must_stay_inside_workspace() {
        assert_eq!(validate_working_directory(None).unwrap(), PathBuf::from("."));
        assert_eq!(
            validate_working_directory(Some("web/app")).unwrap(),
            PathBuf::from("web/app")
        );
        assert!(matches!(
            validate_working_directory(Some("../elsewhere")),
            Err(ExecutorError::Unauthorized(_))
        ));
        assert!(validate_working_directory(Some("/etc")).is_err());
    }

    #[test]
    fn long_output_is_truncated() {
        let out = truncate_output(&vec![b'a'; OUTPUT_BYTES_MAX + 10]);
        assert!(out.ends_with("[truncated 10 bytes]"));
    }

    #[tokio::test]
    async fn shell_runner_captures_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(tmp.path(), Duration::from_secs(10));

        let out = runner
            .run_captured("echo hello; echo oops >&2; exit 3", Path::new("."))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn shell_runner_enforces_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new(tmp.path(), Duration::from_millis(200));
        let err = runner
            .run_captured("sleep 5", Path::new("."))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
