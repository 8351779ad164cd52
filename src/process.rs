//! Thin wrapper around external command-line tools (`ffmpeg`, `ffprobe`).
//!
//! Every invocation is a single attempt: spawn, capture stdout/stderr as text,
//! succeed only on exit status zero.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Captured text output of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed: {message}")]
    Failed {
        program: String,
        code: Option<i32>,
        message: String,
    },

    #[error("{program} timed out after {} seconds", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// Executes external programs. Injected into the export pipeline so tests
/// can replace the real encoder with a fake.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError>;
}

/// Runs programs through `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills the child when it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError> {
        debug!(program, args = %args.join(" "), "spawning process");

        // kill_on_drop makes an abandoned `output()` future (deadline expiry or
        // a dropped export job) terminate the child instead of leaking it.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child).await.map_err(|_| {
                ProcessError::TimedOut {
                    program: program.to_string(),
                    timeout,
                }
            })?,
            None => child.await,
        }
        .map_err(|source| ProcessError::Launch {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            return Ok(ProcessOutput { stdout, stderr });
        }

        let code = output.status.code();
        Err(ProcessError::Failed {
            program: program.to_string(),
            code,
            message: failure_message(program, code, &stderr),
        })
    }
}

/// Prefers whatever the tool printed on stderr, falling back to the exit code.
fn failure_message(program: &str, code: Option<i32>, stderr: &str) -> String {
    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    match code {
        Some(code) => format!("{program} exited with code {code}"),
        None => format!("{program} was terminated by a signal"),
    }
}
