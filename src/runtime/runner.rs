//! Host command runner

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::Result;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Runs programs with `tokio::process`, capturing their output.
///
/// A started process always runs to completion; dropping the future does
/// not kill it.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program, ?args, "Running host command");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(false)
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let runner = TokioCommandRunner;
        let out = runner
            .run("sh", &["-c".into(), "echo hi; echo oops >&2; exit 3".into()])
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let runner = TokioCommandRunner;
        let err = runner
            .run("definitely-not-a-real-binary-4471", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
