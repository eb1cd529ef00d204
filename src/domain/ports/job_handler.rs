use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::errors::DispatchError;
use crate::domain::models::Job;

/// Everything a handler needs to run one job.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub job: Job,
    /// Location of the job document while it executes.
    pub job_path: PathBuf,
    /// Complete, profile-scoped environment for the handler.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Captured result of a handler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Executes jobs of one task type.
///
/// Exit status drives the outcome: a handler that reports `success: false`
/// moves the job to failed. An `Err` means the handler could not run at all
/// and is treated the same way.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Short name for logs and ledger details.
    fn name(&self) -> &str;

    async fn execute(&self, invocation: &HandlerInvocation) -> Result<HandlerOutput, DispatchError>;
}
