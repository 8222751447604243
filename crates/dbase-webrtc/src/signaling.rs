//! Relay connection
//!
//! Keeps one WebSocket to `wss://{host}/ws/{peer_id}` open, forwards inbound
//! offers, answers and candidates to the orchestrator, keeps the socket
//! alive with pings and reconnects after the configured delay when it drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::transport::{SignalingTransport, TransportError};
use crate::types::SignalingMessage;

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Open,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Disconnected => write!(f, "disconnected"),
            SignalingState::Connecting => write!(f, "connecting"),
            SignalingState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
}

/// WebSocket client for the relay
pub struct SignalingClient {
    local_peer_id: String,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<SignalingState>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingClient {
    /// Spawn the relay task. Returns the client and the inbound message stream.
    pub fn start(
        local_peer_id: &str,
        options: SignalingOptions,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SignalingState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(relay_loop(options, outbound_rx, inbound_tx, state_tx, shutdown_rx));

        let client = Arc::new(Self {
            local_peer_id: local_peer_id.to_string(),
            outbound: outbound_tx,
            state: state_rx,
            shutdown_tx,
        });
        (client, inbound_rx)
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingState> {
        self.state.clone()
    }

    /// Wait until the socket is open or `timeout` passes
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == SignalingState::Open))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if self.state() != SignalingState::Open {
            return Err(TransportError::NotConnected);
        }
        let json = msg
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.outbound
            .send(json)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }
}

async fn relay_loop(
    options: SignalingOptions,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<SignalingMessage>,
    state: watch::Sender<SignalingState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        state.send_replace(SignalingState::Connecting);
        match relay_session(&options, &mut outbound, &inbound, &state, &mut shutdown_rx).await {
            Ok(()) => info!("Relay session to {} ended", options.url),
            Err(e) => error!("Relay {} error: {}", options.url, e),
        }
        state.send_replace(SignalingState::Disconnected);

        if *shutdown_rx.borrow() || inbound.is_closed() {
            break;
        }
        debug!("Reconnecting to {} in {:?}", options.url, options.reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(options.reconnect_delay) => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        }
    }
    state.send_replace(SignalingState::Disconnected);
    debug!("Relay task for {} stopped", options.url);
}

async fn relay_session(
    options: &SignalingOptions,
    outbound: &mut mpsc::Receiver<String>,
    inbound: &mpsc::Sender<SignalingMessage>,
    state: &watch::Sender<SignalingState>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    info!("Connecting to relay: {}", options.url);
    let (ws_stream, _) = connect_async(options.url.as_str())
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    // anything queued for a previous socket is stale
    while outbound.try_recv().is_ok() {}
    state.send_replace(SignalingState::Open);
    info!("Connected to relay {}", options.url);

    let mut ping = tokio::time::interval(options.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            _ = ping.tick() => {
                let ping = SignalingMessage::Ping
                    .to_json()
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                write
                    .send(Message::Text(ping.into()))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                debug!("Sent ping to {}", options.url);
            }
            Some(json) = outbound.recv() => {
                write
                    .send(Message::Text(json.into()))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                        Ok(SignalingMessage::Pong) => debug!("Pong from {}", options.url),
                        Ok(SignalingMessage::Ping) => debug!("Ping from {}", options.url),
                        Ok(msg) => {
                            debug!(
                                "Received {} from {}",
                                msg.msg_type(),
                                msg.peer_id().unwrap_or("-")
                            );
                            if inbound.send(msg).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Dropping relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("WebSocket closed: {}", options.url);
                        return Err(TransportError::Disconnected);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(TransportError::ConnectionFailed(e.to_string()));
                    }
                }
            }
        }
    }
}
