//! CLI command implementations.

pub mod breaker;
pub mod bus;
pub mod council;
pub mod dispatch;
pub mod governance;
pub mod job;
pub mod route;
