//! Infrastructure layer module
//!
//! This module contains the adapters between the domain and the outside world:
//! - File-backed storage (JSONL logs, locked JSON documents, the job queue)
//! - Configuration management
//! - Logging infrastructure
//! - Job handler implementations (process and built-in)
//! - Peer transports (local inbox, HTTP)
//!
//! Infrastructure implementations satisfy the port traits defined in the domain layer.

pub mod config;
pub mod handlers;
pub mod logging;
pub mod storage;
pub mod transport;
