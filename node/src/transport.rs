// HTTP peer transport over reqwest

use crate::api::ReplicateResponse;
use async_trait::async_trait;
use regis::{ApplyOutcome, DeltaRecord, Error, PeerTransport, RegistrySnapshot, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn unreachable(peer: &str, reason: impl std::fmt::Display) -> Error {
    Error::PeerUnreachable {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

async fn check(peer: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::PeerRejected {
        peer: peer.to_string(),
        reason: format!("status {status}: {body}"),
    })
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn replicate(&self, peer: &str, record: &DeltaRecord) -> Result<ApplyOutcome> {
        let response = self
            .client
            .post(format!("{peer}/peer/replicate"))
            .json(record)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;

        let body: ReplicateResponse = check(peer, response)
            .await?
            .json()
            .await
            .map_err(|e| unreachable(peer, e))?;
        Ok(body.outcome)
    }

    async fn fetch_registry(&self, peer: &str) -> Result<RegistrySnapshot> {
        let response = self
            .client
            .get(format!("{peer}/registry"))
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;

        check(peer, response)
            .await?
            .json()
            .await
            .map_err(|e| unreachable(peer, e))
    }
}
