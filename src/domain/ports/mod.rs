//! Ports: traits at the boundary between the core and its collaborators.

pub mod job_handler;
pub mod peer_transport;

pub use job_handler::{HandlerInvocation, HandlerOutput, JobHandler};
pub use peer_transport::PeerTransport;
