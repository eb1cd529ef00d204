use async_trait::async_trait;
use std::time::Instant;

use crate::domain::errors::DispatchError;
use crate::domain::models::JobPayload;
use crate::domain::ports::{HandlerInvocation, HandlerOutput, JobHandler};

/// Built-in handler for `echo` jobs. Writes the message (or the job id) to stdout.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, invocation: &HandlerInvocation) -> Result<HandlerOutput, DispatchError> {
        let started = Instant::now();
        let message = match invocation.job.payload() {
            JobPayload::Echo(inputs) => inputs.message,
            _ => None,
        }
        .unwrap_or_else(|| invocation.job.id.clone());

        Ok(HandlerOutput {
            success: true,
            exit_code: Some(0),
            stdout: message,
            stderr: String::new(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Job;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn test_echoes_message_or_id() {
        let with_message = Job::new("j1", "echo", "ops")
            .with_inputs(serde_json::json!({"message": "ping"}));
        let bare = Job::new("j2", "echo", "ops");

        for (job, expected) in [(with_message, "ping"), (bare, "j2")] {
            let invocation = HandlerInvocation {
                job,
                job_path: PathBuf::from("/tmp/x.json"),
                env: BTreeMap::new(),
                timeout: Duration::from_secs(1),
            };
            let output = EchoHandler.execute(&invocation).await.unwrap();
            assert!(output.success);
            assert_eq!(output.stdout, expected);
        }
    }
}
