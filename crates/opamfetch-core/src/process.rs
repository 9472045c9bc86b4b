//! Subprocess execution seam for git, patch and tar.

use crate::error::{OpamError, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Runs external programs.
///
/// Implementations return captured stdout on success and
/// [`OpamError::ProcessExecution`] with captured stderr on a non-zero exit.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String>;
}

/// Runs programs on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<String> {
        let command_line = format!("{program} {}", args.join(" "));
        debug!(command = %command_line, cwd = ?cwd, "spawning");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(std::process::Stdio::null());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| OpamError::ProcessExecution {
            command: command_line.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(OpamError::ProcessExecution {
                command: command_line,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Convenience for call sites holding `&str` arguments.
pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let out = SystemRunner
            .run("sh", &args(["-c", "echo hello"]), None)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_reports_stderr() {
        let err = SystemRunner
            .run("sh", &args(["-c", "echo broken >&2; exit 3"]), None)
            .await
            .unwrap_err();
        match err {
            OpamError::ProcessExecution { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let err = SystemRunner
            .run("opamfetch-no-such-program", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, OpamError::ProcessExecution { code: None, .. }));
    }
}
