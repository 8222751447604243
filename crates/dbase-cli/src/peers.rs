//! Replica peer lookup
//!
//! `POST https://{host}/get_peers_for_file` with `{"wallet_address": ..}`
//! answers `{"file_peers": [..]}`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Serialize)]
struct PeersRequest<'a> {
    wallet_address: &'a str,
}

#[derive(Deserialize)]
struct PeersResponse {
    #[serde(default)]
    file_peers: Vec<String>,
}

pub struct PeerDirectory {
    client: Client,
    url: String,
    timeout: Duration,
}

impl PeerDirectory {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("HTTP client setup failed, using defaults: {}", e);
                Client::new()
            }
        };
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// Peers that should hold replicas of files owned by `wallet_address`
    pub async fn peers_for_file(&self, wallet_address: &str) -> Result<Vec<String>> {
        let body = tokio::time::timeout(self.timeout, self.lookup(wallet_address))
            .await
            .map_err(|_| anyhow!("Peer lookup at {} timed out after {:?}", self.url, self.timeout))??;

        if body.file_peers.is_empty() {
            warn!("Peer lookup for {} returned no peers", wallet_address);
        } else {
            debug!("Peer lookup for {}: {:?}", wallet_address, body.file_peers);
        }
        Ok(body.file_peers)
    }

    async fn lookup(&self, wallet_address: &str) -> Result<PeersResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(&PeersRequest { wallet_address })
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()
            .context("Peer lookup rejected")?;
        response.json().await.context("Invalid peer lookup response")
    }
}
