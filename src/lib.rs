//! Conclave - governed job dispatcher and agent council
//!
//! Conclave drains a directory queue of job documents through a chain of
//! governance gates (circuit breaker, kill switch, leases, fairness, budgets,
//! human approval) before running each job's handler. Next to the dispatcher
//! sits a council of agents that talk over an append-only message bus; a
//! supervisor scores their round outputs, the winning diffs are applied
//! to the repository, and a reflection pass turns recurring findings into
//! guidance. Jobs can also be routed to peer dispatchers with at-least-once
//! delivery.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and ports
//! - **Service Layer** (`services`): dispatcher, governance and council logic
//! - **Infrastructure Layer** (`infrastructure`): storage, config, logging,
//!   handlers and peer transports
//! - **CLI Layer** (`cli`): command-line interface
//!
//! All state lives under one directory as JSON documents and JSON-lines
//! logs; concurrent writers coordinate through `flock` on sibling lock files.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{
    BusError, CouncilError, DispatchError, PatchError, RouteError, StorageError, TransportError,
};
pub use domain::models::{Config, Job, LedgerEntry, LedgerState};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::storage::StateLayout;
pub use services::{
    CouncilBus, CouncilSupervisor, JobDispatcher, PatchApplier, ReflectionLearner, TaskRouter,
};
