//! Peer-to-peer chunk replication for dbase
//!
//! Nodes find each other through a WebSocket relay, negotiate WebRTC
//! connections with offer/answer/candidate exchange, and replicate chunk
//! records over a reliable ordered data channel.
//!
//! # Overview
//!
//! - **Signaling**: [`SignalingClient`] keeps the relay socket alive
//! - **Connections**: [`PeerOrchestrator`] drives caller and callee negotiation
//!   and reconnects dropped callers
//! - **Transfer**: [`TransferEngine`] runs handshake-gated sessions and stores
//!   received records in the peer chunk folder
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dbase_fs::ChunkFolder;
//! use dbase_webrtc::{
//!     OrchestratorConfig, PeerOrchestrator, RealPeerConnectionFactory, SignalingClient,
//!     SignalingOptions, TransferConfig, TransferEngine, TurnCredentialsFetcher,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (signaling, inbound) = SignalingClient::start(
//!         "node-a",
//!         SignalingOptions {
//!             url: "wss://relay.example.org/ws/node-a".to_string(),
//!             ping_interval: Duration::from_secs(60),
//!             reconnect_delay: Duration::from_secs(5),
//!         },
//!     );
//!     let ice = Arc::new(TurnCredentialsFetcher::new(
//!         "https://relay.example.org/fetch_turn_credentials",
//!         Duration::from_secs(5),
//!     ));
//!     let (orchestrator, channels) = PeerOrchestrator::new(
//!         signaling,
//!         Arc::new(RealPeerConnectionFactory::new()),
//!         ice,
//!         OrchestratorConfig::default(),
//!     );
//!     let peer_store = Arc::new(ChunkFolder::new("peer_store")?);
//!     let engine = TransferEngine::new(orchestrator.clone(), peer_store, TransferConfig::default());
//!
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     tokio::spawn(orchestrator.run(inbound, shutdown));
//!     tokio::spawn(engine.clone().run(channels));
//!
//!     engine.send_text("node-b", "hello").await?;
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod mock;
pub mod orchestrator;
pub mod protocol;
pub mod real;
pub mod signaling;
pub mod transfer;
pub mod transport;
pub mod types;

pub use credentials::{
    fallback_ice_servers, IceServer, IceServerProvider, IceUrls, StaticIceServers,
    TurnCredentialsFetcher, FALLBACK_STUN_URLS,
};
pub use orchestrator::{ChannelAvailable, OrchestratorConfig, PeerOrchestrator};
pub use protocol::{frame_record, ControlMessage, Reassembler, MAX_FRAME_SIZE, MAX_RECORD_SIZE};
pub use real::RealPeerConnectionFactory;
pub use signaling::{SignalingClient, SignalingOptions, SignalingState};
pub use transfer::{
    RecordCallback, TextCallback, TransferConfig, TransferEngine, TransferError, TransferEvent,
};
pub use transport::{
    ChannelFrame, ChannelOrigin, ConnectionState, DataChannel, NegotiationError, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventKind, ProtocolError, SignalingTransport,
    TransportError,
};
pub use types::{
    IceCandidate, PeerState, Role, SdpType, SessionDescription, SetupPhase, SignalingMessage,
    DATA_CHANNEL_LABEL,
};
