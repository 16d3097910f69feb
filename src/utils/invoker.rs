// src/utils/invoker.rs: running external tools

use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;
use crate::config::defs::PipelineError;
use crate::utils::command::ToolCommand;


#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was killed by a signal.
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolClassification {
    Success,
    SuccessWithDiagnostics,
    Fatal,
}

impl ToolOutcome {
    pub fn ok(stdout: &str) -> Self {
        ToolOutcome { stdout: stdout.to_string(), stderr: String::new(), exit_status: Some(0) }
    }

    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn classify(&self) -> ToolClassification {
        match (self.success(), self.stderr.trim().is_empty()) {
            (true, true) => ToolClassification::Success,
            (true, false) => ToolClassification::SuccessWithDiagnostics,
            (false, _) => ToolClassification::Fatal,
        }
    }

    pub fn status_label(&self) -> String {
        match self.exit_status {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        }
    }
}


/// Runs one external tool to completion. Implementations know nothing
/// about stages; a spawn failure is an Err, a non-zero exit is not.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError>;
}


/// Spawns the real process with both streams captured.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    timeout: Option<Duration>,
}

impl ProcessInvoker {
    pub fn new(timeout: Option<Duration>) -> Self {
        ProcessInvoker { timeout }
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
        debug!("Running: {}", command);
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| PipelineError::ToolExecution {
            tool: command.program.clone(),
            error: format!("failed to spawn: {}. Is {} installed?", e, command.program),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| PipelineError::ToolTimeout {
                    tool: command.program.clone(),
                    secs: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| PipelineError::ToolExecution {
            tool: command.program.clone(),
            error: e.to_string(),
        })?;

        Ok(ToolOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: output.status.code(),
        })
    }
}


/// Invokes a tool and applies the success/fatal classification.
/// Stderr on a zero exit is surfaced in the log but never halts.
///
/// # Arguments
///
/// * `invoker` - Tool runner (real or fake).
/// * `command` - Structured command to run.
///
/// # Returns
/// ToolOutcome on exit 0, PipelineError::ToolFailed otherwise.
pub async fn run_tool(invoker: &dyn ToolInvoker, command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
    let outcome = invoker.invoke(command).await?;
    match outcome.classify() {
        ToolClassification::Success => {}
        ToolClassification::SuccessWithDiagnostics => {
            if command.stderr_is_diagnostic {
                debug!("{} diagnostics:\n{}", command.program, outcome.stderr.trim_end());
            } else {
                warn!("{} wrote to stderr:\n{}", command.program, outcome.stderr.trim_end());
            }
        }
        ToolClassification::Fatal => {
            return Err(PipelineError::ToolFailed {
                tool: command.program.clone(),
                status: outcome.status_label(),
                stderr: outcome.stderr.trim().to_string(),
            });
        }
    }
    Ok(outcome)
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_classification() {
        let mut outcome = ToolOutcome::ok("done");
        assert_eq!(outcome.classify(), ToolClassification::Success);
        outcome.stderr = "Warning: 3 reads discarded".to_string();
        assert_eq!(outcome.classify(), ToolClassification::SuccessWithDiagnostics);
        outcome.exit_status = Some(1);
        assert_eq!(outcome.classify(), ToolClassification::Fatal);
        outcome.exit_status = None;
        assert_eq!(outcome.classify(), ToolClassification::Fatal);
        assert_eq!(outcome.status_label(), "signal");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_captures_streams() -> Result<()> {
        let invoker = ProcessInvoker::default();
        let cmd = ToolCommand::new("sh").args(["-c", "echo out; echo warn >&2"]);
        let outcome = run_tool(&invoker, &cmd).await?;
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "warn");
        assert_eq!(outcome.classify(), ToolClassification::SuccessWithDiagnostics);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_nonzero_is_fatal() -> Result<()> {
        let invoker = ProcessInvoker::default();
        let cmd = ToolCommand::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        match run_tool(&invoker, &cmd).await {
            Err(PipelineError::ToolFailed { tool, status, stderr }) => {
                assert_eq!(tool, "sh");
                assert_eq!(status, "3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected ToolFailed, got {:?}", other),
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_invoker_timeout() -> Result<()> {
        let invoker = ProcessInvoker::new(Some(Duration::from_millis(100)));
        let cmd = ToolCommand::new("sleep").arg("5");
        let err = invoker.invoke(&cmd).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolTimeout { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let invoker = ProcessInvoker::default();
        let cmd = ToolCommand::new("definitely-not-a-real-tool-xyz");
        let err = invoker.invoke(&cmd).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolExecution { .. }));
    }
}
