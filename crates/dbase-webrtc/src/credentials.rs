//! ICE server lists
//!
//! A fresh TURN credential set is fetched from the relay host before every
//! connection attempt. The public STUN list is appended on success and used
//! alone when the fetch fails, so connection setup never blocks on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Public STUN servers used when no TURN credentials are available
pub const FALLBACK_STUN_URLS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// `urls` may be a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// One traversal server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: IceUrls::One(url.to_string()),
            username: None,
            credential: None,
        }
    }
}

pub fn fallback_ice_servers() -> Vec<IceServer> {
    FALLBACK_STUN_URLS.iter().map(|url| IceServer::stun(url)).collect()
}

/// Source of ICE servers for a new connection. Never fails; degrades to a fallback.
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn ice_servers(&self) -> Vec<IceServer>;
}

/// `GET https://{host}/fetch_turn_credentials`
pub struct TurnCredentialsFetcher {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl TurnCredentialsFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("HTTP client setup failed, using defaults: {}", e);
                reqwest::Client::new()
            }
        };
        Self {
            url: url.into(),
            http,
            timeout,
        }
    }

    async fn request(&self) -> Result<Vec<IceServer>, reqwest::Error> {
        self.http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<IceServer>>()
            .await
    }

    async fn fetch(&self) -> Result<Vec<IceServer>, String> {
        // bounded even when the client came up without its timeout
        match tokio::time::timeout(self.timeout, self.request()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", self.timeout)),
        }
    }
}

#[async_trait]
impl IceServerProvider for TurnCredentialsFetcher {
    async fn ice_servers(&self) -> Vec<IceServer> {
        match self.fetch().await {
            Ok(mut servers) => {
                debug!("Fetched {} TURN servers from {}", servers.len(), self.url);
                servers.extend(fallback_ice_servers());
                servers
            }
            Err(e) => {
                warn!("TURN credential fetch failed, using public STUN: {}", e);
                fallback_ice_servers()
            }
        }
    }
}

/// Fixed list, for tests and offline use
pub struct StaticIceServers(pub Vec<IceServer>);

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn ice_servers(&self) -> Vec<IceServer> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_response() {
        let json = r#"[
            {"urls": "turn:turn.example.org:3478", "username": "u", "credential": "p"},
            {"urls": ["turns:a:5349", "turn:b:3478"]}
        ]"#;
        let servers: Vec<IceServer> = serde_json::from_str(json).unwrap();
        assert_eq!(servers[0].urls.to_vec(), vec!["turn:turn.example.org:3478"]);
        assert_eq!(servers[0].username.as_deref(), Some("u"));
        assert_eq!(servers[1].urls.to_vec().len(), 2);
        assert!(servers[1].credential.is_none());
    }

    #[test]
    fn test_fallback_list() {
        let servers = fallback_ice_servers();
        assert_eq!(servers.len(), 5);
        assert_eq!(servers[0].urls.to_vec(), vec!["stun:stun.l.google.com:19302"]);
    }

    #[tokio::test]
    async fn test_silent_host_falls_back_in_time() {
        // accepts the connection, never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let fetcher = TurnCredentialsFetcher::new(
            format!("http://{}/fetch_turn_credentials", addr),
            Duration::from_millis(200),
        );
        let servers = tokio::time::timeout(Duration::from_secs(5), fetcher.ice_servers())
            .await
            .unwrap();
        assert_eq!(servers, fallback_ice_servers());
    }

    #[tokio::test]
    async fn test_unreachable_host_falls_back() {
        let fetcher = TurnCredentialsFetcher::new(
            "http://127.0.0.1:9/fetch_turn_credentials",
            Duration::from_millis(500),
        );
        assert_eq!(fetcher.ice_servers().await, fallback_ice_servers());
    }
}
