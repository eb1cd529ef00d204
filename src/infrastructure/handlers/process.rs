//! External process handler.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::domain::errors::DispatchError;
use crate::domain::models::HandlerConfig;
use crate::domain::ports::{HandlerInvocation, HandlerOutput, JobHandler};

/// How long a handler gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Runs a configured command with the job document path as its last argument.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    name: String,
    command: String,
    args: Vec<String>,
}

impl ProcessHandler {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }

    pub fn from_config(task_type: &str, config: &HandlerConfig) -> Self {
        Self::new(task_type, config.command.clone(), config.args.clone())
    }
}

enum Exit {
    Status(std::process::ExitStatus),
    TimedOut,
}

#[async_trait]
impl JobHandler for ProcessHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, invocation: &HandlerInvocation) -> Result<HandlerOutput, DispatchError> {
        let started = Instant::now();
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&invocation.job_path)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::HandlerFailure {
                task_type: invocation.job.task_type.clone(),
                reason: format!("failed to spawn {}: {e}", self.command),
            })?;

        debug!(
            job_id = %invocation.job.id,
            handler = %self.name,
            pid = ?child.id(),
            "handler started"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let timeout = invocation.timeout;

        let (exit, stdout, stderr) = tokio::join!(
            async {
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(status) => status.map(Exit::Status),
                    Err(_) => {
                        warn!(
                            job_id = %invocation.job.id,
                            timeout_secs = timeout.as_secs(),
                            "handler timed out, terminating"
                        );
                        terminate(&mut child).await;
                        Ok(Exit::TimedOut)
                    }
                }
            },
            read_pipe(stdout),
            read_pipe(stderr),
        );

        let exit = exit.map_err(|e| DispatchError::HandlerFailure {
            task_type: invocation.job.task_type.clone(),
            reason: format!("failed to wait for handler: {e}"),
        })?;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(match exit {
            Exit::Status(status) => HandlerOutput {
                success: status.success(),
                exit_code: status.code(),
                stdout,
                stderr,
                duration_ms,
            },
            Exit::TimedOut => HandlerOutput {
                success: false,
                exit_code: None,
                stdout,
                stderr: format!("{stderr}\nhandler timed out after {}s", timeout.as_secs()),
                duration_ms,
            },
        })
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to send SIGTERM to handler");
        }
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("handler ignored SIGTERM, forcing kill");
            let _ = child.kill().await;
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        warn!(error = %e, "failed to read handler output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
