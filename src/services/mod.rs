//! Dispatch, governance and council services.

pub mod audit_log;
pub mod circuit_breaker;
pub mod council_bus;
pub mod council_supervisor;
pub mod detectors;
pub mod diff_parser;
pub mod dispatch_ledger;
pub mod governance;
pub mod handler_registry;
pub mod idempotency;
pub mod job_dispatcher;
pub mod job_scorer;
pub mod lease_manager;
pub mod patch_applier;
pub mod reflection;
pub mod task_router;

pub use audit_log::{AuditAction, AuditCategory, AuditFilter, AuditLevel, AuditLog, AuditRecord};
pub use circuit_breaker::CircuitBreaker;
pub use council_bus::{CouncilBus, Outgoing};
pub use council_supervisor::CouncilSupervisor;
pub use detectors::{Detector, DetectorRegistry};
pub use dispatch_ledger::DispatchLedger;
pub use governance::Governance;
pub use handler_registry::HandlerRegistry;
pub use idempotency::IdempotencyStore;
pub use job_dispatcher::{CycleReport, JobDispatcher};
pub use job_scorer::JobScorer;
pub use lease_manager::LeaseManager;
pub use patch_applier::{ApplyResult, PatchApplier};
pub use reflection::ReflectionLearner;
pub use task_router::{RouteRequest, TaskRouter};
