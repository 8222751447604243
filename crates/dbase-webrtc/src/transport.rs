//! Transport abstraction
//!
//! Traits for the relay connection, peer connections and data channels, so
//! the orchestrator and transfer engine run the same way over webrtc-rs and
//! over the in-memory mocks.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::credentials::IceServer;
use crate::types::{IceCandidate, SessionDescription, SignalingMessage};

/// Relay or data channel not usable; retried with bounded backoff
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Offer/answer/candidate application failed; the attempt is abandoned
#[derive(Debug, Error, Clone)]
pub enum NegotiationError {
    #[error("No connection for peer {0}")]
    NoConnection(String),
    #[error("Session description failed: {0}")]
    Description(String),
    #[error("ICE candidate failed: {0}")]
    Candidate(String),
    #[error("Connection setup failed: {0}")]
    Connection(String),
}

/// Malformed or mismatched message; dropped without affecting the connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Transfer id mismatch: expected {expected}, got {got}")]
    TransferIdMismatch { expected: String, got: String },
    #[error("Record exceeds {limit} bytes without parsing")]
    RecordTooLarge { limit: usize },
}

/// One data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// Control message (JSON)
    Text(String),
    /// Payload slice
    Binary(Vec<u8>),
}

impl ChannelFrame {
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Text(s) => s.len(),
            ChannelFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered, reliable data channel to one peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the channel is closed
    async fn recv(&self) -> Option<ChannelFrame>;

    /// Bytes accepted by `send_*` but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Connection-level state changes reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Who opened a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Created by us; our send channel
    Local,
    /// Announced by the remote side; our receive channel
    Remote,
}

/// What a peer connection reports back to its owner
#[derive(Clone)]
pub enum PeerEventKind {
    /// A local candidate to publish to the remote side
    IceCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The remote side opened a channel towards us
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpened(ChannelOrigin),
    ChannelClosed(ChannelOrigin),
}

impl fmt::Debug for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEventKind::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEventKind::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEventKind::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEventKind::ChannelOpened(o) => f.debug_tuple("ChannelOpened").field(o).finish(),
            PeerEventKind::ChannelClosed(o) => f.debug_tuple("ChannelClosed").field(o).finish(),
        }
    }
}

/// Event tagged with the connection it came from.
///
/// `generation` distinguishes a reconnected peer's new connection from
/// late callbacks of the one it replaced.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: String,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// One negotiated connection to a remote peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a data channel from our side
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    async fn close(&self);
}

/// Creates peer connections wired to an event sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        ice_servers: &[IceServer],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Outbound half of the relay connection
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    fn local_peer_id(&self) -> &str;
}

// Blanket implementations for Arc<T> so Arc-wrapped transports can be used directly

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        (**self).send_text(text).await
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError> {
        (**self).send_binary(data).await
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        (**self).recv().await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: SignalingTransport + ?Sized> SignalingTransport for Arc<T> {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        (**self).send(msg).await
    }

    fn local_peer_id(&self) -> &str {
        (**self).local_peer_id()
    }
}
