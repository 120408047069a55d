//! Backend process invocation
//!
//! One child per request: spawn with the serialized event as the final
//! argument, drain stdout and stderr concurrently, then reap the exit status.

use crate::config::BackendConfig;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Largest event the kernel accepts as a single argument, NUL included (Linux `MAX_ARG_STRLEN`)
pub const MAX_ARGUMENT_BYTES: usize = 128 * 1024;

/// Errors raised before a backend run produces an exit status
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The executable could not be started
    #[error("Failed to spawn backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Reading a pipe or waiting on the child failed
    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The event cannot be passed as one process argument
    #[error("Event of {0} bytes exceeds the {limit} byte argument limit", limit = MAX_ARGUMENT_BYTES)]
    ArgumentTooLong(usize),
    /// The configured time limit elapsed
    #[error("Backend timed out after {0} seconds")]
    Timeout(u64),
}

/// Everything a finished backend produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    /// Accumulated standard output
    pub stdout: String,
    /// Accumulated standard error
    pub stderr: String,
    /// Exit code, `None` when the process was terminated by a signal
    pub status: Option<i32>,
}

impl BackendOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Spawns the configured executable once per call to [`run`](BackendRunner::run).
///
/// The runner holds no per-request state, so a single instance is shared
/// across all concurrent invocations.
#[derive(Debug, Clone)]
pub struct BackendRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl BackendRunner {
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let (program, args) = config.program()?;
        Ok(Self {
            program,
            args,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            timeout: config.timeout(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn command(&self, payload: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(payload);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }

    /// Run the backend with `payload` as its last argument and wait for it to exit.
    pub async fn run(&self, payload: &str) -> Result<BackendOutput, BackendError> {
        if !fits_argument(payload) {
            return Err(BackendError::ArgumentTooLong(payload.len()));
        }

        let started = Instant::now();

        let mut child = self.command(payload).spawn().map_err(|source| BackendError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        debug!(program = %self.program, pid, "Backend process spawned");

        let collected = match self.timeout {
            Some(limit) => {
                let result = tokio::time::timeout(limit, collect(&mut child)).await;
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            program = %self.program,
                            pid,
                            timeout_secs = limit.as_secs(),
                            "Backend timed out, killing process"
                        );
                        if let Err(e) = child.kill().await {
                            warn!(pid, error = %e, "Failed to kill timed out backend");
                        }
                        return Err(BackendError::Timeout(limit.as_secs()));
                    }
                }
            }
            None => collect(&mut child).await,
        };
        let output = collected?;

        info!(
            program = %self.program,
            pid,
            status = ?output.status,
            duration_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Backend exited"
        );

        Ok(output)
    }
}

/// Whether `payload` plus its terminating NUL fits in one argument
pub fn fits_argument(payload: &str) -> bool {
    payload.len() < MAX_ARGUMENT_BYTES
}

/// Drain both pipes to EOF, then reap the child.
async fn collect(child: &mut Child) -> Result<BackendOutput, BackendError> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;
    let status = child.wait().await?;

    Ok(BackendOutput {
        stdout,
        stderr,
        status: status.code(),
    })
}

async fn read_stream<R>(stream: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
