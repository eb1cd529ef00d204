use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::errors::TransportError;
use crate::domain::models::{AckEnvelope, TaskEnvelope};
use crate::domain::ports::PeerTransport;

/// POSTs the envelope as JSON and parses the peer's ack.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    http_client: ReqwestClient,
}

impl HttpTransport {
    /// Build a transport whose requests give up after `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http_client = ReqwestClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }

    async fn deliver(&self, envelope: &TaskEnvelope) -> Result<AckEnvelope, TransportError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            warn!(url = %self.url, status = %status, response_body = %body, "peer rejected envelope");
            return Err(TransportError::Transport(format!(
                "peer returned {status}: {body}"
            )));
        }

        let ack: AckEnvelope = response
            .json()
            .await
            .map_err(|e| TransportError::NotAcknowledged(format!("unparseable ack: {e}")))?;
        debug!(url = %self.url, task_id = %envelope.task_id, ack_status = %ack.ack_status, "peer answered");
        Ok(ack)
    }
}
