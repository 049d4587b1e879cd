use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub command: String,
    pub work_dir: Option<String>,
    /// Overlaid on the parent environment; overrides win on collision.
    pub env: BTreeMap<String, String>,
    /// Kill the command when the deadline expires.
    pub timeout: Option<Duration>,
    /// External cancellation; kills the command when triggered.
    pub cancel: Option<CancellationToken>,
}

/// Why an execution did not run to normal completion. A non-zero exit code
/// is a normal completion and is not represented here.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn shell: {0}")]
    Spawn(std::io::Error),
    #[error("command timed out")]
    TimedOut,
    #[error("command canceled")]
    Canceled,
    #[error("process terminated by signal")]
    Signaled,
    #[error("failed to wait for process: {0}")]
    Wait(std::io::Error),
}

/// Outcome of a command execution.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code of the child, or -1 when it never ran or died to a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<ExecError>,
}

impl ExecResult {
    /// True when the command ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }
}

/// Runs shell command strings via `$SHELL -c` (falling back to `/bin/sh`),
/// capturing output and honoring a cancellable deadline.
#[derive(Debug, Clone)]
pub struct Executor {
    shell: String,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

enum Waited {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Canceled,
}

impl Executor {
    pub fn new() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self { shell }
    }

    /// Run a command to completion, deadline or cancellation, whichever
    /// comes first. Never panics and never returns early with unreaped
    /// children: on deadline or cancellation the child is killed and awaited.
    pub async fn execute(&self, opts: ExecOptions) -> ExecResult {
        let start = Instant::now();

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&opts.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: start.elapsed(),
                    error: Some(ExecError::Spawn(e)),
                };
            }
        };

        // Drain both pipes concurrently so a chatty child cannot fill one
        // and stall.
        let stdout_task = tokio::spawn(read_to_end(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_end(child.stderr.take()));

        let cancel = opts.cancel.unwrap_or_default();
        let deadline = async {
            match opts.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Waited::Exited(status),
                Err(e) => Waited::WaitFailed(e),
            },
            _ = cancel.cancelled() => Waited::Canceled,
            _ = deadline => Waited::TimedOut,
        };

        let (status, mut error) = match waited {
            Waited::Exited(status) => (Some(status), None),
            Waited::WaitFailed(e) => (None, Some(ExecError::Wait(e))),
            Waited::TimedOut => {
                let status = kill_and_reap(&mut child).await;
                (status, Some(ExecError::TimedOut))
            }
            Waited::Canceled => {
                let status = kill_and_reap(&mut child).await;
                (status, Some(ExecError::Canceled))
            }
        };

        let exit_code = match status {
            Some(status) => match status.code() {
                Some(code) => code,
                None => {
                    if error.is_none() {
                        error = Some(ExecError::Signaled);
                    }
                    -1
                }
            },
            None => -1,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
            error,
        }
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child) -> Option<std::process::ExitStatus> {
    let _ = child.start_kill();
    child.wait().await.ok()
}

async fn read_to_end(pipe: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}
