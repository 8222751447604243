//! Real WebRTC peer connection factory
//!
//! Wraps the webrtc crate to implement PeerConnectionFactory for production use.
//! Callbacks from webrtc-rs are turned into [`PeerEvent`]s on the orchestrator's
//! event channel; channel messages are queued for [`DataChannel::recv`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::credentials::IceServer;
use crate::transport::{
    ChannelFrame, ChannelOrigin, ConnectionState, DataChannel, NegotiationError, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventKind, TransportError,
};
use crate::types::{IceCandidate, SdpType, SessionDescription};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type FrameSender = Arc<StdMutex<Option<mpsc::UnboundedSender<ChannelFrame>>>>;

/// Wrapper around RTCDataChannel that implements our DataChannel trait
struct RealDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    frames: Mutex<mpsc::UnboundedReceiver<ChannelFrame>>,
}

impl RealDataChannel {
    /// Install handlers on `dc` and report open/close as `origin`
    fn wrap(
        dc: Arc<RTCDataChannel>,
        peer_id: &str,
        generation: u64,
        origin: ChannelOrigin,
        events: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender: FrameSender = Arc::new(StdMutex::new(Some(tx)));
        let label = dc.label().to_string();

        let msg_sender = sender.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelFrame::Binary(msg.data.to_vec())
            };
            if let Ok(guard) = msg_sender.lock() {
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send(frame);
                }
            }
            Box::pin(async {})
        }));

        let open_events = events.clone();
        let open_peer = peer_id.to_string();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            let peer_id = open_peer.clone();
            let label = open_label.clone();
            Box::pin(async move {
                info!("Data channel '{}' to {} open", label, peer_id);
                let _ = events
                    .send(PeerEvent {
                        peer_id,
                        generation,
                        kind: PeerEventKind::ChannelOpened(origin),
                    })
                    .await;
            })
        }));

        let close_peer = peer_id.to_string();
        dc.on_close(Box::new(move || {
            // ends recv() once queued frames are drained
            if let Ok(mut guard) = sender.lock() {
                guard.take();
            }
            let events = events.clone();
            let peer_id = close_peer.clone();
            Box::pin(async move {
                debug!("Data channel to {} closed", peer_id);
                let _ = events
                    .send(PeerEvent {
                        peer_id,
                        generation,
                        kind: PeerEventKind::ChannelClosed(origin),
                    })
                    .await;
            })
        }));

        Arc::new(Self {
            dc,
            label,
            frames: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl DataChannel for RealDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.dc
            .send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        self.frames.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// One webrtc-rs connection
struct RealPeerConnection {
    pc: Arc<RTCPeerConnection>,
    peer_id: String,
    generation: u64,
    events: mpsc::Sender<PeerEvent>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| NegotiationError::Description(e.to_string()))
}

#[async_trait]
impl PeerConnection for RealPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        // default init: ordered and reliable
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| NegotiationError::Connection(e.to_string()))?;
        let channel = RealDataChannel::wrap(
            dc,
            &self.peer_id,
            self.generation,
            ChannelOrigin::Local,
            self.events.clone(),
        );
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Closing connection to {}: {}", self.peer_id, e);
        }
    }
}

/// Real WebRTC peer connection factory
///
/// Creates actual WebRTC connections using the webrtc crate.
#[derive(Default)]
pub struct RealPeerConnectionFactory;

impl RealPeerConnectionFactory {
    pub fn new() -> Self {
        Self
    }

    async fn create_connection(ice_servers: &[IceServer]) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Connection(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::Connection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.to_vec(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| NegotiationError::Connection(e.to_string()))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerConnectionFactory for RealPeerConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        ice_servers: &[IceServer],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let pc = Self::create_connection(ice_servers).await?;

        // Handle ICE candidates - work MUST be inside the returned future
        let ice_events = events.clone();
        let ice_peer = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            let peer_id = ice_peer.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = events
                            .send(PeerEvent {
                                peer_id,
                                generation,
                                kind: PeerEventKind::IceCandidate(candidate),
                            })
                            .await;
                    }
                    Err(e) => warn!("Failed to encode ICE candidate for {}: {}", peer_id, e),
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer_id = state_peer.clone();
            Box::pin(async move {
                info!("Peer {} connection state: {}", peer_id, state);
                if let Some(state) = map_state(state) {
                    let _ = events
                        .send(PeerEvent {
                            peer_id,
                            generation,
                            kind: PeerEventKind::StateChanged(state),
                        })
                        .await;
                }
            })
        }));

        let dc_events = events.clone();
        let dc_peer = peer_id.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = dc_events.clone();
            let peer_id = dc_peer.clone();
            Box::pin(async move {
                info!("Peer {} opened data channel '{}'", peer_id, dc.label());
                let channel = RealDataChannel::wrap(
                    dc,
                    &peer_id,
                    generation,
                    ChannelOrigin::Remote,
                    events.clone(),
                );
                let _ = events
                    .send(PeerEvent {
                        peer_id,
                        generation,
                        kind: PeerEventKind::DataChannel(channel),
                    })
                    .await;
            })
        }));

        Ok(Arc::new(RealPeerConnection {
            pc,
            peer_id: peer_id.to_string(),
            generation,
            events,
        }))
    }
}
