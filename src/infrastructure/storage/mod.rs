//! File-backed storage primitives.
//!
//! - `JsonlLog`: append-only newline-delimited records (ledger, fairness, audit, bus)
//! - `JsonDocument`: locked read-modify-write JSON files (leases, budgets, proposals)
//! - `JobQueue`: inbox / processed / failed directories
//! - `StateLayout`: where everything lives under the state directory

pub mod json_document;
pub mod jsonl;
pub mod layout;
pub mod lock;
pub mod queue;

pub use json_document::JsonDocument;
pub use jsonl::JsonlLog;
pub use layout::{digest_file_name, sanitize, StateLayout};
pub use lock::FileLock;
pub use queue::{JobQueue, QueuedDocument};
