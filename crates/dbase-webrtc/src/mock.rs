//! Mock implementations for testing
//!
//! In-memory relay, data channels and peer connections. Connections created
//! through one [`MockNetwork`] link up when the caller applies the answer,
//! the way a real ICE/DTLS handshake completes after offer/answer exchange.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::debug;

use crate::credentials::IceServer;
use crate::transport::{
    ChannelFrame, ChannelOrigin, ConnectionState, DataChannel, NegotiationError, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventKind, SignalingTransport, TransportError,
};
use crate::types::{IceCandidate, SdpType, SessionDescription, SignalingMessage};

const INBOX_CAPACITY: usize = 1024;
const CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Mock Signaling Hub
// ============================================================================

/// Routes signaling messages between registered peers, stamping the sender
/// id on delivery like the real relay does with `source_id`.
#[derive(Default)]
pub struct MockSignalingHub {
    inboxes: RwLock<HashMap<String, mpsc::Sender<SignalingMessage>>>,
}

impl MockSignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a peer; returns its outbound transport and its inbox
    pub async fn register(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> (Arc<MockSignaling>, mpsc::Receiver<SignalingMessage>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().await.insert(peer_id.to_string(), tx);
        let transport = Arc::new(MockSignaling {
            peer_id: peer_id.to_string(),
            hub: self.clone(),
            sent: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    pub async fn unregister(&self, peer_id: &str) {
        self.inboxes.write().await.remove(peer_id);
    }

    async fn route(&self, from: &str, msg: SignalingMessage) -> Result<(), TransportError> {
        let (target, delivered) = match msg {
            SignalingMessage::Offer { peer_id, offer } => (
                peer_id,
                SignalingMessage::Offer { peer_id: from.to_string(), offer },
            ),
            SignalingMessage::Answer { peer_id, answer } => (
                peer_id,
                SignalingMessage::Answer { peer_id: from.to_string(), answer },
            ),
            SignalingMessage::Candidate { peer_id, candidate } => (
                peer_id,
                SignalingMessage::Candidate { peer_id: from.to_string(), candidate },
            ),
            // the relay answers pings itself
            SignalingMessage::Ping => (from.to_string(), SignalingMessage::Pong),
            SignalingMessage::Pong => return Ok(()),
        };

        let inbox = self
            .inboxes
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| TransportError::SendFailed(format!("unknown peer {}", target)))?;
        inbox
            .send(delivered)
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

/// One peer's connection to the [`MockSignalingHub`]
pub struct MockSignaling {
    peer_id: String,
    hub: Arc<MockSignalingHub>,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl MockSignaling {
    /// Everything this peer has published, in order
    pub async fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        self.sent.lock().await.push(msg.clone());
        self.hub.route(&self.peer_id, msg).await
    }

    fn local_peer_id(&self) -> &str {
        &self.peer_id
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

#[derive(Default)]
struct ChannelShared {
    open: AtomicBool,
    closed: Notify,
}

/// One end of an in-memory data channel pair
pub struct MockDataChannel {
    label: String,
    tx: mpsc::Sender<ChannelFrame>,
    rx: Mutex<mpsc::Receiver<ChannelFrame>>,
    shared: Arc<ChannelShared>,
    frames_sent: AtomicUsize,
    /// Bytes sent by this end that the other end has not read yet
    queued_out: Arc<AtomicUsize>,
    /// Same counter as the other end's `queued_out`
    queued_in: Arc<AtomicUsize>,
}

impl MockDataChannel {
    /// Connected pair, not yet open
    pub fn pair(label: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(ChannelShared::default());
        let a_to_b = Arc::new(AtomicUsize::new(0));
        let b_to_a = Arc::new(AtomicUsize::new(0));

        let a = Self {
            label: label.to_string(),
            tx: tx_b, // A sends to B's receiver
            rx: Mutex::new(rx_a),
            shared: shared.clone(),
            frames_sent: AtomicUsize::new(0),
            queued_out: a_to_b.clone(),
            queued_in: b_to_a.clone(),
        };
        let b = Self {
            label: label.to_string(),
            tx: tx_a, // B sends to A's receiver
            rx: Mutex::new(rx_b),
            shared,
            frames_sent: AtomicUsize::new(0),
            queued_out: b_to_a,
            queued_in: a_to_b,
        };
        (a, b)
    }

    /// Connected pair, already open
    pub fn open_pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = Self::pair(label);
        a.set_open();
        (Arc::new(a), Arc::new(b))
    }

    /// Opens both ends
    pub fn set_open(&self) {
        self.shared.open.store(true, Ordering::SeqCst);
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: ChannelFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let len = frame.len();
        self.queued_out.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(frame).await.is_err() {
            self.queued_out.fetch_sub(len, Ordering::SeqCst);
            return Err(TransportError::Disconnected);
        }
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delivered(&self, frame: Option<ChannelFrame>) -> Option<ChannelFrame> {
        if let Some(frame) = &frame {
            self.queued_in.fetch_sub(frame.len(), Ordering::SeqCst);
        }
        frame
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_frame(ChannelFrame::Text(text.to_string())).await
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send_frame(ChannelFrame::Binary(data.to_vec())).await
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        let mut rx = self.rx.lock().await;
        loop {
            // registered before the check so a concurrent close is not missed
            let closed = self.shared.closed.notified();
            if !self.is_open() {
                // drain what was delivered before the close
                return self.delivered(rx.try_recv().ok());
            }
            tokio::select! {
                biased;
                frame = rx.recv() => return self.delivered(frame),
                _ = closed => {}
            }
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.queued_out.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.closed.notify_waiters();
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

/// Callee side registered under an offer token, waiting for the caller to link
struct AnswerSide {
    events: mpsc::Sender<PeerEvent>,
    caller_id: String,
    generation: u64,
}

/// Shared fabric connecting mock peer connections
#[derive(Default)]
pub struct MockNetwork {
    answers: Mutex<HashMap<String, AnswerSide>>,
    unreachable: RwLock<HashSet<String>>,
    next_token: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory for connections made by `local_peer_id`
    pub fn factory(self: &Arc<Self>, local_peer_id: &str) -> Arc<MockConnectionFactory> {
        Arc::new(MockConnectionFactory {
            local_peer_id: local_peer_id.to_string(),
            network: self.clone(),
            created: RwLock::new(Vec::new()),
        })
    }

    /// Make connection creation towards `peer_id` fail
    pub async fn set_unreachable(&self, peer_id: &str, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(peer_id.to_string());
        } else {
            set.remove(peer_id);
        }
    }
}

fn emit(events: &mpsc::Sender<PeerEvent>, peer_id: &str, generation: u64, kind: PeerEventKind) {
    let event = PeerEvent {
        peer_id: peer_id.to_string(),
        generation,
        kind,
    };
    if events.try_send(event).is_err() {
        debug!("Mock event for {} dropped", peer_id);
    }
}

#[derive(Default)]
struct MockConnectionState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// (our end, their end) of channels created before linking
    channels: Vec<(Arc<MockDataChannel>, Arc<MockDataChannel>)>,
    applied: Vec<IceCandidate>,
    closed: bool,
}

/// In-memory peer connection
pub struct MockPeerConnection {
    local_peer_id: String,
    remote_peer_id: String,
    generation: u64,
    events: mpsc::Sender<PeerEvent>,
    network: Arc<MockNetwork>,
    state: Mutex<MockConnectionState>,
}

impl MockPeerConnection {
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remote candidates applied so far, in order
    pub async fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().await.applied.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Simulate the connection dropping
    pub async fn fail(&self) {
        let channels = self.state.lock().await.channels.clone();
        for (ours, _) in channels {
            ours.close().await;
        }
        emit(
            &self.events,
            &self.remote_peer_id,
            self.generation,
            PeerEventKind::StateChanged(ConnectionState::Failed),
        );
    }

    fn token(desc: &SessionDescription) -> Result<&str, NegotiationError> {
        desc.sdp
            .split_once(':')
            .map(|(_, token)| token)
            .ok_or_else(|| NegotiationError::Description(format!("bad mock sdp {:?}", desc.sdp)))
    }

    /// Caller side: the answer completes the handshake and opens every channel
    async fn link(&self, token: &str) -> Result<(), NegotiationError> {
        let answer_side = self
            .network
            .answers
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| NegotiationError::Description(format!("no answer side for {}", token)))?;

        let channels = self.state.lock().await.channels.clone();
        for (ours, theirs) in channels {
            ours.set_open();
            emit(
                &answer_side.events,
                &answer_side.caller_id,
                answer_side.generation,
                PeerEventKind::DataChannel(theirs),
            );
            emit(
                &answer_side.events,
                &answer_side.caller_id,
                answer_side.generation,
                PeerEventKind::ChannelOpened(ChannelOrigin::Remote),
            );
            emit(
                &self.events,
                &self.remote_peer_id,
                self.generation,
                PeerEventKind::ChannelOpened(ChannelOrigin::Local),
            );
        }

        for (events, peer, generation) in [
            (&self.events, self.remote_peer_id.as_str(), self.generation),
            (&answer_side.events, answer_side.caller_id.as_str(), answer_side.generation),
        ] {
            emit(events, peer, generation, PeerEventKind::StateChanged(ConnectionState::Connected));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let (ours, theirs) = MockDataChannel::pair(label);
        let ours = Arc::new(ours);
        self.state
            .lock()
            .await
            .channels
            .push((ours.clone(), Arc::new(theirs)));
        Ok(ours)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let n = self.network.next_token.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!(
            "mock-offer:{}-{}",
            self.local_peer_id, n
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock().await;
        let remote = state
            .remote
            .as_ref()
            .ok_or_else(|| NegotiationError::Description("no remote offer".to_string()))?;
        Ok(SessionDescription::answer(format!("mock-answer:{}", Self::token(remote)?)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.state.lock().await.local = Some(desc);
        // gathering starts once the local description is set
        let n = self.network.next_token.fetch_add(1, Ordering::SeqCst);
        emit(
            &self.events,
            &self.remote_peer_id,
            self.generation,
            PeerEventKind::IceCandidate(IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 {} typ host", n, 50000 + n),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        );
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let token = Self::token(&desc)?.to_string();
        self.state.lock().await.remote = Some(desc.clone());

        match desc.sdp_type {
            SdpType::Offer => {
                self.network.answers.lock().await.insert(
                    token,
                    AnswerSide {
                        events: self.events.clone(),
                        caller_id: self.remote_peer_id.clone(),
                        generation: self.generation,
                    },
                );
                Ok(())
            }
            SdpType::Answer => self.link(&token).await,
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        if state.remote.is_none() {
            return Err(NegotiationError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().await.remote.is_some()
    }

    async fn close(&self) {
        let channels = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.channels.clone()
        };
        for (ours, _) in channels {
            ours.close().await;
        }
    }
}

/// Creates [`MockPeerConnection`]s on a [`MockNetwork`]
pub struct MockConnectionFactory {
    local_peer_id: String,
    network: Arc<MockNetwork>,
    created: RwLock<Vec<Arc<MockPeerConnection>>>,
}

impl MockConnectionFactory {
    /// Connections created towards `peer_id`, oldest first
    pub async fn connections(&self, peer_id: &str) -> Vec<Arc<MockPeerConnection>> {
        self.created
            .read()
            .await
            .iter()
            .filter(|c| c.remote_peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub async fn latest(&self, peer_id: &str) -> Option<Arc<MockPeerConnection>> {
        self.connections(peer_id).await.pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        _ice_servers: &[IceServer],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.network.unreachable.read().await.contains(peer_id) {
            return Err(NegotiationError::Connection(format!("{} unreachable", peer_id)));
        }
        let connection = Arc::new(MockPeerConnection {
            local_peer_id: self.local_peer_id.clone(),
            remote_peer_id: peer_id.to_string(),
            generation,
            events,
            network: self.network.clone(),
            state: Mutex::new(MockConnectionState::default()),
        });
        self.created.write().await.push(connection.clone());
        Ok(connection)
    }
}
