pub mod budget;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod governance;
pub mod guidance;
pub mod job;
pub mod lease;
pub mod ledger;
pub mod patch;
pub mod verdict;

pub use budget::{BudgetRecord, SpendEvent};
pub use bus::{
    BusMessage, Intent, MessageStatus, Proposal, ProposalStatus, VoteDecision, BROADCAST,
};
pub use config::{
    duration_from_secs, BreakerConfig, Config, CouncilConfig, DispatcherConfig, GovernanceConfig, HandlerConfig,
    LoggingConfig, PatchConfig, PathsConfig, PeerConfig, ProfileConfig, ReflectionConfig,
    RiskPenalties, RouterConfig,
};
pub use envelope::{
    AckEnvelope, DeadLetter, DeliveryMode, OutboxEntry, TaskEnvelope, ACK_CONTRACT_VERSION,
    ENVELOPE_SCHEMA_VERSION,
};
pub use governance::{ApprovalTokenEntry, BreakerSentinel, CircuitState};
pub use guidance::{Guidance, GuidanceItem};
pub use job::{
    ContentGenerationInputs, EchoInputs, Job, JobLocation, JobPayload, JobPolicy,
    MarketScanInputs, RiskTier, ScreenCaptureInputs,
};
pub use lease::{Lease, LeaseOutcome, RenewOutcome};
pub use ledger::{FairnessEntry, LedgerEntry, LedgerState};
pub use patch::{BlockOutcome, BlockReport, PatchReceipt};
pub use verdict::{
    Finding, OntologyConflict, RoundReport, Verdict, VerdictStatus, OK_THRESHOLD,
    SUSPECT_THRESHOLD,
};
