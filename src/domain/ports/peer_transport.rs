use async_trait::async_trait;

use crate::domain::errors::TransportError;
use crate::domain::models::{AckEnvelope, TaskEnvelope};

/// Delivers an envelope to one peer and returns the peer's ack.
///
/// Returning `Ok` only means the peer answered; the router still inspects
/// the ack status before treating the envelope as delivered.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn describe(&self) -> String;

    async fn deliver(&self, envelope: &TaskEnvelope) -> Result<AckEnvelope, TransportError>;
}
