//! Domain errors for the Conclave dispatcher and council.

use thiserror::Error;

/// Errors from the file-backed stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record in {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to lock {path}: {reason}")]
    Lock { path: String, reason: String },
}

impl StorageError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn serde(path: impl AsRef<std::path::Path>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Which gate denied a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Budget,
    Fairness,
    Approval,
    KillSwitch,
}

impl DenialKind {
    /// Budget and fairness denials are retried by a later cycle.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Budget | Self::Fairness)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Fairness => "fairness",
            Self::Approval => "approval",
            Self::KillSwitch => "kill_switch",
        }
    }
}

/// Errors raised while dispatching a job.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Malformed job document {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Policy denied ({}): {reason}", kind.as_str())]
    PolicyDenied { kind: DenialKind, reason: String },

    #[error("Lease for {job_id} held by {owner}")]
    LeaseConflict { job_id: String, owner: String },

    #[error("Lease for {job_id} lost during execution")]
    LeaseLost { job_id: String },

    #[error("Handler for {task_type} failed: {reason}")]
    HandlerFailure { task_type: String, reason: String },

    #[error("No handler registered for task type {0}")]
    UnknownTaskType(String),

    #[error("Circuit breaker open (fail ratio {fail_ratio:.2})")]
    CircuitOpen { fail_ratio: f64 },

    #[error("Kill switch engaged")]
    KillSwitch,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DispatchError {
    /// Whether this error leaves the job in the inbox for a later cycle.
    pub fn is_soft(&self) -> bool {
        match self {
            Self::PolicyDenied { kind, .. } => kind.is_soft(),
            Self::LeaseConflict { .. } => true,
            _ => false,
        }
    }
}

/// Errors from the council bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message {id} already {status}")]
    NotClaimable { id: String, status: String },

    #[error("Message {0} already acked")]
    AlreadyAcked(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Proposal {0} already resolved")]
    ProposalResolved(String),

    #[error("Invalid quorum: {0}")]
    InvalidQuorum(usize),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the council supervisor.
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("Round {0} has no agent outputs")]
    NoOutputs(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the patch applier.
///
/// `Rejected` and `VerificationFailed` are scoped to a single diff block and
/// are recorded in the receipt rather than aborting the round.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Block {index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    #[error("Verification failed after block {index}: {reason}")]
    VerificationFailed { index: usize, reason: String },

    #[error("Rollback of block {index} failed: {reason}")]
    RollbackFailed { index: usize, reason: String },

    #[error("Round {0} has not been scored")]
    ReportMissing(String),

    #[error("Round {0} has no scored winner")]
    NoWinner(String),

    #[error("Round output missing: {0}")]
    OutputMissing(String),

    #[error("Failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the remote task router.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Duplicate task_id within idempotency window: {0}")]
    Duplicate(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Delivery of {task_id} exhausted after {attempts} attempts: {reason}")]
    DeliveryExhausted {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Failed to build transport: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from a single transport attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer did not acknowledge: {0}")]
    NotAcknowledged(String),

    #[error("Attempt timed out after {0}s")]
    Timeout(u64),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
