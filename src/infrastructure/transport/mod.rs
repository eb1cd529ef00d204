//! Peer transports for the remote task router.

pub mod http;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::TransportError;
use crate::domain::models::PeerConfig;
use crate::domain::ports::PeerTransport;

pub use http::HttpTransport;
pub use local::LocalTransport;

/// Build the transport for one configured peer.
pub fn transport_for(
    peer: &PeerConfig,
    attempt_timeout: Duration,
) -> Result<Arc<dyn PeerTransport>, TransportError> {
    Ok(match peer {
        PeerConfig::Local { inbox_dir } => Arc::new(LocalTransport::new(inbox_dir.clone())),
        PeerConfig::Http { url } => Arc::new(HttpTransport::new(url.clone(), attempt_timeout)?),
    })
}
