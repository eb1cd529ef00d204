use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::errors::TransportError;
use crate::domain::models::{AckEnvelope, Job, JobPolicy, TaskEnvelope};
use crate::domain::ports::PeerTransport;
use crate::infrastructure::storage::json_document::write_json_atomic;
use crate::infrastructure::storage::sanitize;

/// Delivers by writing a job document into another dispatcher's inbox.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    inbox_dir: PathBuf,
}

impl LocalTransport {
    pub fn new(inbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            inbox_dir: inbox_dir.into(),
        }
    }

    /// Job document the peer dispatcher will pick up for this envelope.
    ///
    /// `task_type`, `target_profile`, `policy` and `inputs` are read from the
    /// payload when present. Otherwise the whole payload becomes the inputs of
    /// a `remote_task` job for the receiver's profile.
    pub fn job_for(envelope: &TaskEnvelope) -> Job {
        let payload = &envelope.payload;
        let text = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let mut job = Job::new(
            envelope.task_id.clone(),
            text("task_type").unwrap_or_else(|| "remote_task".to_string()),
            text("target_profile").unwrap_or_else(|| envelope.receiver.clone()),
        );
        job.policy = payload
            .get("policy")
            .and_then(|p| serde_json::from_value::<JobPolicy>(p.clone()).ok())
            .unwrap_or_default();
        job.inputs = payload
            .get("inputs")
            .cloned()
            .unwrap_or_else(|| payload.clone());
        job.trace_id = Some(envelope.task_id.clone());
        job
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    fn describe(&self) -> String {
        format!("local:{}", self.inbox_dir.display())
    }

    async fn deliver(&self, envelope: &TaskEnvelope) -> Result<AckEnvelope, TransportError> {
        let job = Self::job_for(envelope);
        let path = self
            .inbox_dir
            .join(format!("{}.json", sanitize(&envelope.task_id)));

        write_json_atomic(&path, &job).map_err(|e| TransportError::Transport(e.to_string()))?;
        debug!(task_id = %envelope.task_id, path = %path.display(), "envelope dropped into peer inbox");
        Ok(AckEnvelope::new("queued"))
    }
}
