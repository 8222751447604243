//! Peer connection orchestrator
//!
//! Owns every peer connection of this node. Drives the caller side
//! (fetch ICE servers, create connection and channel, publish offer) and the
//! callee side (accept offer, publish answer), applies remote candidates
//! once a remote description exists and buffers them until then, and
//! redrives the caller sequence when a connection drops.
//!
//! All connection state lives here; the transfer engine only sees channels
//! handed out through [`ChannelAvailable`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::credentials::IceServerProvider;
use crate::transport::{
    ChannelOrigin, ConnectionState, DataChannel, NegotiationError, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventKind, SignalingTransport,
};
use crate::types::{IceCandidate, PeerState, Role, SessionDescription, SetupPhase, SignalingMessage, DATA_CHANNEL_LABEL};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Caller-side reconnection attempts after a connection drops
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// A channel that just opened, for the transfer engine to read from
#[derive(Clone)]
pub struct ChannelAvailable {
    pub peer_id: String,
    pub origin: ChannelOrigin,
    pub channel: Arc<dyn DataChannel>,
}

struct PeerEntry {
    role: Role,
    phase: SetupPhase,
    generation: u64,
    connection: Option<Arc<dyn PeerConnection>>,
    pending_candidates: VecDeque<IceCandidate>,
    send_channel: Option<Arc<dyn DataChannel>>,
    receive_channel: Option<Arc<dyn DataChannel>>,
    send_open: Option<bool>,
    receive_open: Option<bool>,
    reconnecting: bool,
    reconnects_left: u32,
}

impl PeerEntry {
    fn new(reconnect_attempts: u32) -> Self {
        Self {
            role: Role::Callee,
            phase: SetupPhase::Idle,
            generation: 0,
            connection: None,
            pending_candidates: VecDeque::new(),
            send_channel: None,
            receive_channel: None,
            send_open: None,
            receive_open: None,
            reconnecting: false,
            reconnects_left: reconnect_attempts,
        }
    }

    fn snapshot(&self, peer_id: &str) -> PeerState {
        PeerState {
            peer_id: peer_id.to_string(),
            role: self.role,
            phase: self.phase,
            send_open: self.send_open,
            receive_open: self.receive_open,
            pending_candidates: self.pending_candidates.len(),
        }
    }

    /// Swap in a fresh connection, closing the one it replaces
    async fn replace_connection(&mut self, role: Role, generation: u64, connection: Arc<dyn PeerConnection>) {
        if let Some(old) = self.connection.replace(connection) {
            old.close().await;
        }
        self.role = role;
        self.generation = generation;
        self.phase = SetupPhase::Idle;
        self.send_channel = None;
        self.receive_channel = None;
        self.send_open = None;
        self.receive_open = None;
    }
}

pub struct PeerOrchestrator {
    local_peer_id: String,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: Arc<dyn IceServerProvider>,
    config: OrchestratorConfig,
    peers: RwLock<HashMap<String, Arc<Mutex<PeerEntry>>>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    channels_tx: mpsc::Sender<ChannelAvailable>,
    ready: watch::Sender<bool>,
    generation: AtomicU64,
}

impl PeerOrchestrator {
    /// Returns the orchestrator and the stream of channels as they open
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: Arc<dyn IceServerProvider>,
        config: OrchestratorConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ChannelAvailable>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (channels_tx, channels_rx) = mpsc::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(false);
        let orchestrator = Arc::new(Self {
            local_peer_id: signaling.local_peer_id().to_string(),
            signaling,
            factory,
            ice,
            config,
            peers: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channels_tx,
            ready,
            generation: AtomicU64::new(1),
        });
        (orchestrator, channels_rx)
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Process relay messages and connection events until shutdown.
    ///
    /// Can only be started once; later calls return immediately.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<SignalingMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            warn!("Orchestrator already running");
            return;
        };

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        info!("Signaling inbox closed");
                        break;
                    };
                    let peer = msg.peer_id().unwrap_or("-").to_string();
                    let kind = msg.msg_type();
                    if let Err(e) = self.handle_signal(msg).await {
                        warn!("Failed to handle {} from {}: {}", kind, peer, e);
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
            }
        }

        self.close_all().await;
        info!("Orchestrator stopped");
    }

    async fn entry(&self, peer_id: &str) -> Arc<Mutex<PeerEntry>> {
        if let Some(entry) = self.peers.read().await.get(peer_id) {
            return entry.clone();
        }
        self.peers
            .write()
            .await
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PeerEntry::new(self.config.reconnect_attempts))))
            .clone()
    }

    async fn existing(&self, peer_id: &str) -> Option<Arc<Mutex<PeerEntry>>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    async fn publish(&self, msg: SignalingMessage) -> Result<(), NegotiationError> {
        let kind = msg.msg_type();
        self.signaling
            .send(msg)
            .await
            .map_err(|e| NegotiationError::Connection(format!("publishing {}: {}", kind, e)))
    }

    /// Caller role: open a connection to `peer_id` and publish an offer.
    ///
    /// Any existing connection to the peer is replaced.
    pub async fn connect(&self, peer_id: &str) -> Result<(), NegotiationError> {
        if peer_id == self.local_peer_id {
            return Err(NegotiationError::Connection("cannot connect to self".to_string()));
        }
        info!("Connecting to {}", peer_id);

        let ice_servers = self.ice.ice_servers().await;
        let generation = self.next_generation();
        let connection = self
            .factory
            .create(peer_id, generation, &ice_servers, self.events_tx.clone())
            .await?;
        let channel = connection.create_data_channel(DATA_CHANNEL_LABEL).await?;

        let entry = self.entry(peer_id).await;
        let mut e = entry.lock().await;
        e.replace_connection(Role::Caller, generation, connection.clone()).await;
        e.send_channel = Some(channel);
        e.send_open = Some(false);
        // candidates queued for an earlier connection no longer apply
        e.pending_candidates.clear();

        let result: Result<(), NegotiationError> = async {
            let offer = connection.create_offer().await?;
            e.phase = SetupPhase::OfferCreated;
            connection.set_local_description(offer.clone()).await?;
            e.phase = SetupPhase::LocalDescriptionSet;
            self.publish(SignalingMessage::Offer {
                peer_id: peer_id.to_string(),
                offer,
            })
            .await
        }
        .await;

        match &result {
            Ok(()) => debug!("Offer sent to {} (generation {})", peer_id, generation),
            Err(_) => e.phase = SetupPhase::Disconnected,
        }
        drop(e);
        self.update_ready().await;
        result
    }

    /// Dispatch one validated relay message
    pub async fn handle_signal(&self, msg: SignalingMessage) -> Result<(), NegotiationError> {
        match msg {
            SignalingMessage::Offer { peer_id, offer } => self.handle_offer(&peer_id, offer).await,
            SignalingMessage::Answer { peer_id, answer } => self.handle_answer(&peer_id, answer).await,
            SignalingMessage::Candidate { peer_id, candidate } => {
                self.handle_candidate(&peer_id, candidate).await
            }
            SignalingMessage::Pong => {
                debug!("Relay pong");
                Ok(())
            }
            SignalingMessage::Ping => Ok(()),
        }
    }

    async fn handle_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<(), NegotiationError> {
        info!("Offer from {}", peer_id);
        let ice_servers = self.ice.ice_servers().await;
        let generation = self.next_generation();
        let connection = self
            .factory
            .create(peer_id, generation, &ice_servers, self.events_tx.clone())
            .await?;

        let entry = self.entry(peer_id).await;
        let mut e = entry.lock().await;
        e.replace_connection(Role::Callee, generation, connection.clone()).await;

        let result: Result<(), NegotiationError> = async {
            connection.set_remote_description(offer).await?;
            e.phase = SetupPhase::RemoteDescriptionSet;
            Self::flush_candidates(peer_id, &mut e, &connection).await;

            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            e.phase = SetupPhase::LocalDescriptionSet;
            self.publish(SignalingMessage::Answer {
                peer_id: peer_id.to_string(),
                answer,
            })
            .await?;
            e.phase = SetupPhase::AnswerSent;
            Ok(())
        }
        .await;

        if let Err(err) = &result {
            error!("Peer {} unreachable, offer rejected: {}", peer_id, err);
            e.phase = SetupPhase::Disconnected;
        }
        result
    }

    async fn handle_answer(&self, peer_id: &str, answer: SessionDescription) -> Result<(), NegotiationError> {
        let entry = self
            .existing(peer_id)
            .await
            .ok_or_else(|| NegotiationError::NoConnection(peer_id.to_string()))?;
        let mut e = entry.lock().await;
        let connection = e
            .connection
            .clone()
            .ok_or_else(|| NegotiationError::NoConnection(peer_id.to_string()))?;

        info!("Answer from {}", peer_id);
        if let Err(err) = connection.set_remote_description(answer).await {
            error!("Peer {} unreachable, answer rejected: {}", peer_id, err);
            e.phase = SetupPhase::Disconnected;
            return Err(err);
        }
        e.phase = SetupPhase::RemoteDescriptionSet;
        Self::flush_candidates(peer_id, &mut e, &connection).await;
        Ok(())
    }

    async fn handle_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let entry = self.entry(peer_id).await;
        let mut e = entry.lock().await;
        match e.connection.clone() {
            Some(connection) if connection.has_remote_description().await => {
                debug!("Applying candidate from {}", peer_id);
                connection.add_ice_candidate(candidate).await
            }
            _ => {
                e.pending_candidates.push_back(candidate);
                debug!(
                    "Queued candidate from {} ({} pending)",
                    peer_id,
                    e.pending_candidates.len()
                );
                Ok(())
            }
        }
    }

    /// Apply queued candidates in arrival order, leaving the queue empty
    async fn flush_candidates(peer_id: &str, e: &mut PeerEntry, connection: &Arc<dyn PeerConnection>) {
        if e.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued candidates for {}",
            e.pending_candidates.len(),
            peer_id
        );
        for candidate in e.pending_candidates.drain(..) {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                warn!("Queued candidate for {} rejected: {}", peer_id, err);
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        let Some(entry) = self.existing(&event.peer_id).await else {
            return;
        };
        let peer_id = event.peer_id;
        let mut e = entry.lock().await;
        if e.generation != event.generation {
            debug!(
                "Ignoring stale event for {} (generation {}, current {})",
                peer_id, event.generation, e.generation
            );
            return;
        }

        let mut opened = None;
        let mut reconnect = false;
        match event.kind {
            PeerEventKind::IceCandidate(candidate) => {
                let msg = SignalingMessage::Candidate {
                    peer_id: peer_id.clone(),
                    candidate,
                };
                if let Err(err) = self.publish(msg).await {
                    warn!("Could not publish candidate to {}: {}", peer_id, err);
                }
            }
            PeerEventKind::StateChanged(ConnectionState::Connected) => {
                info!("Peer {} connected", peer_id);
            }
            PeerEventKind::StateChanged(state) => {
                warn!("Peer {} connection {:?}", peer_id, state);
                e.phase = SetupPhase::Disconnected;
                e.send_open = e.send_open.map(|_| false);
                e.receive_open = e.receive_open.map(|_| false);
                reconnect = e.role == Role::Caller
                    && state != ConnectionState::Closed
                    && !e.reconnecting;
            }
            PeerEventKind::DataChannel(channel) => {
                info!("Peer {} opened channel '{}'", peer_id, channel.label());
                let open = channel.is_open();
                e.receive_channel = Some(channel.clone());
                e.receive_open = Some(open);
                if open {
                    e.phase = SetupPhase::ChannelOpen;
                    opened = Some((ChannelOrigin::Remote, channel));
                }
            }
            PeerEventKind::ChannelOpened(origin) => {
                let (was_open, channel) = match origin {
                    ChannelOrigin::Local => (e.send_open, e.send_channel.clone()),
                    ChannelOrigin::Remote => (e.receive_open, e.receive_channel.clone()),
                };
                match origin {
                    ChannelOrigin::Local => e.send_open = Some(true),
                    ChannelOrigin::Remote => e.receive_open = Some(true),
                }
                if was_open != Some(true) {
                    opened = channel.map(|c| (origin, c));
                }
                e.phase = SetupPhase::ChannelOpen;
                e.reconnects_left = self.config.reconnect_attempts;
                info!("Channel to {} open ({:?})", peer_id, origin);
            }
            PeerEventKind::ChannelClosed(origin) => {
                match origin {
                    ChannelOrigin::Local => e.send_open = Some(false),
                    ChannelOrigin::Remote => e.receive_open = Some(false),
                }
                info!("Channel to {} closed ({:?})", peer_id, origin);
            }
        }
        if reconnect {
            e.reconnecting = true;
        }
        drop(e);

        if let Some((origin, channel)) = opened {
            let available = ChannelAvailable {
                peer_id: peer_id.clone(),
                origin,
                channel,
            };
            if self.channels_tx.send(available).await.is_err() {
                debug!("No transfer engine listening for channels");
            }
        }
        if reconnect {
            let this = self.clone();
            tokio::spawn(async move { this.reconnect(peer_id).await });
        }
        self.update_ready().await;
    }

    /// Redrive the caller sequence a bounded number of times
    async fn reconnect(self: Arc<Self>, peer_id: String) {
        let Some(entry) = self.existing(&peer_id).await else {
            return;
        };

        loop {
            let attempt = {
                let mut e = entry.lock().await;
                if e.reconnects_left == 0 {
                    e.reconnecting = false;
                    error!(
                        "Giving up on {} after {} reconnection attempts",
                        peer_id, self.config.reconnect_attempts
                    );
                    return;
                }
                e.reconnects_left -= 1;
                self.config.reconnect_attempts - e.reconnects_left
            };

            tokio::time::sleep(self.config.reconnect_interval).await;
            info!(
                "Reconnecting to {} (attempt {}/{})",
                peer_id, attempt, self.config.reconnect_attempts
            );
            match self.connect(&peer_id).await {
                Ok(()) => {
                    entry.lock().await.reconnecting = false;
                    return;
                }
                Err(err) => warn!("Reconnect attempt {} to {} failed: {}", attempt, peer_id, err),
            }
        }
    }

    async fn update_ready(&self) {
        let entries: Vec<(String, Arc<Mutex<PeerEntry>>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut ready = false;
        for (peer_id, entry) in entries {
            if entry.lock().await.snapshot(&peer_id).is_ready() {
                ready = true;
                break;
            }
        }
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    /// True while at least one peer is ready to communicate
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub async fn is_ready(&self, peer_id: &str) -> bool {
        match self.existing(peer_id).await {
            Some(entry) => entry.lock().await.snapshot(peer_id).is_ready(),
            None => false,
        }
    }

    pub async fn state(&self, peer_id: &str) -> Option<PeerState> {
        let entry = self.existing(peer_id).await?;
        let e = entry.lock().await;
        Some(e.snapshot(peer_id))
    }

    pub async fn peers(&self) -> Vec<PeerState> {
        let entries: Vec<(String, Arc<Mutex<PeerEntry>>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut states = Vec::with_capacity(entries.len());
        for (peer_id, entry) in entries {
            states.push(entry.lock().await.snapshot(&peer_id));
        }
        states.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        states
    }

    /// An open channel to `peer_id`, preferring the one we created
    pub async fn channel(&self, peer_id: &str) -> Option<Arc<dyn DataChannel>> {
        let entry = self.existing(peer_id).await?;
        let e = entry.lock().await;
        let open = [e.send_channel.as_ref(), e.receive_channel.as_ref()]
            .into_iter()
            .flatten()
            .find(|c| c.is_open())
            .cloned();
        open
    }

    /// Close the connection to one peer and forget it
    pub async fn disconnect(&self, peer_id: &str) {
        let Some(entry) = self.peers.write().await.remove(peer_id) else {
            return;
        };
        let mut e = entry.lock().await;
        if let Some(connection) = e.connection.take() {
            connection.close().await;
        }
        info!("Disconnected from {}", peer_id);
        drop(e);
        self.update_ready().await;
    }

    async fn close_all(&self) {
        let peers: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for peer_id in peers {
            self.disconnect(&peer_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticIceServers;
    use crate::mock::{MockConnectionFactory, MockNetwork, MockSignaling, MockSignalingHub};

    struct Node {
        orchestrator: Arc<PeerOrchestrator>,
        factory: Arc<MockConnectionFactory>,
        signaling: Arc<MockSignaling>,
        channels: mpsc::Receiver<ChannelAvailable>,
        inbox: Option<mpsc::Receiver<SignalingMessage>>,
    }

    async fn node(hub: &Arc<MockSignalingHub>, network: &Arc<MockNetwork>, id: &str) -> Node {
        let (signaling, inbox) = hub.register(id).await;
        let factory = network.factory(id);
        let (orchestrator, channels) = PeerOrchestrator::new(
            signaling.clone(),
            factory.clone(),
            Arc::new(StaticIceServers(Vec::new())),
            OrchestratorConfig {
                reconnect_attempts: 2,
                reconnect_interval: Duration::from_millis(10),
            },
        );
        Node {
            orchestrator,
            factory,
            signaling,
            channels,
            inbox: Some(inbox),
        }
    }

    fn start(node: &mut Node) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        let inbox = node.inbox.take().unwrap();
        tokio::spawn(node.orchestrator.clone().run(inbox, rx));
        tx
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.2 {} typ host", n, 6000 + n))
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_flushed_in_order() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let b = node(&hub, &network, "b").await;
        let _a = hub.register("a").await;

        for n in 0..3 {
            b.orchestrator
                .handle_signal(SignalingMessage::Candidate {
                    peer_id: "a".to_string(),
                    candidate: candidate(n),
                })
                .await
                .unwrap();
        }
        assert_eq!(b.orchestrator.state("a").await.unwrap().pending_candidates, 3);

        b.orchestrator
            .handle_signal(SignalingMessage::Offer {
                peer_id: "a".to_string(),
                offer: SessionDescription::offer("mock-offer:a-99"),
            })
            .await
            .unwrap();

        let pc = b.factory.latest("a").await.unwrap();
        assert_eq!(pc.applied_candidates().await, vec![candidate(0), candidate(1), candidate(2)]);
        let state = b.orchestrator.state("a").await.unwrap();
        assert_eq!(state.pending_candidates, 0);
        assert_eq!(state.phase, SetupPhase::AnswerSent);
        assert_eq!(state.role, Role::Callee);

        // later candidates go straight through, earlier ones are not reapplied
        b.orchestrator
            .handle_signal(SignalingMessage::Candidate {
                peer_id: "a".to_string(),
                candidate: candidate(3),
            })
            .await
            .unwrap();
        assert_eq!(
            pc.applied_candidates().await,
            vec![candidate(0), candidate(1), candidate(2), candidate(3)]
        );

        let sent = b.signaling.sent().await;
        assert!(matches!(&sent[0], SignalingMessage::Answer { peer_id, .. } if peer_id == "a"));
    }

    #[tokio::test]
    async fn test_candidate_before_answer_is_queued() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let a = node(&hub, &network, "a").await;
        let _b = hub.register("b").await;

        a.orchestrator.connect("b").await.unwrap();
        a.orchestrator
            .handle_signal(SignalingMessage::Candidate {
                peer_id: "b".to_string(),
                candidate: candidate(1),
            })
            .await
            .unwrap();
        let pc = a.factory.latest("b").await.unwrap();
        assert!(pc.applied_candidates().await.is_empty());
        assert_eq!(a.orchestrator.state("b").await.unwrap().phase, SetupPhase::LocalDescriptionSet);

        // answer for an offer nobody registered is rejected by the mock
        assert!(a
            .orchestrator
            .handle_signal(SignalingMessage::Answer {
                peer_id: "b".to_string(),
                answer: SessionDescription::answer("mock-answer:none"),
            })
            .await
            .is_err());

        assert!(matches!(
            a.orchestrator
                .handle_signal(SignalingMessage::Answer {
                    peer_id: "zed".to_string(),
                    answer: SessionDescription::answer("mock-answer:x"),
                })
                .await,
            Err(NegotiationError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_two_nodes_become_ready() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let mut a = node(&hub, &network, "a").await;
        let mut b = node(&hub, &network, "b").await;
        let _stop_a = start(&mut a);
        let _stop_b = start(&mut b);
        let mut ready = a.orchestrator.subscribe_ready();

        a.orchestrator.connect("b").await.unwrap();

        let a_channel = a.channels.recv().await.unwrap();
        assert_eq!(a_channel.peer_id, "b");
        assert_eq!(a_channel.origin, ChannelOrigin::Local);
        let b_channel = b.channels.recv().await.unwrap();
        assert_eq!(b_channel.peer_id, "a");
        assert_eq!(b_channel.origin, ChannelOrigin::Remote);

        let orch = a.orchestrator.clone();
        eventually(|| {
            let orch = orch.clone();
            async move { orch.is_ready("b").await }
        })
        .await;
        assert!(b.orchestrator.is_ready("a").await);
        ready.wait_for(|r| *r).await.unwrap();

        // callee applied the caller's candidate after the offer
        let orch_b = b.factory.clone();
        eventually(|| {
            let f = orch_b.clone();
            async move {
                match f.latest("a").await {
                    Some(pc) => !pc.applied_candidates().await.is_empty(),
                    None => false,
                }
            }
        })
        .await;

        let a_state = a.orchestrator.state("b").await.unwrap();
        assert_eq!(a_state.send_open, Some(true));
        assert_eq!(a_state.receive_open, None);

        // both sides hand out the open channel for sending
        let found = a.orchestrator.channel("b").await.unwrap();
        assert!(Arc::ptr_eq(&found, &a_channel.channel));
        assert!(b.orchestrator.channel("a").await.unwrap().is_open());

        a_channel.channel.send_text("hello").await.unwrap();
        assert_eq!(
            b_channel.channel.recv().await,
            Some(crate::transport::ChannelFrame::Text("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn test_caller_reconnects_after_failure() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let mut a = node(&hub, &network, "a").await;
        let mut b = node(&hub, &network, "b").await;
        let _stop_a = start(&mut a);
        let _stop_b = start(&mut b);

        a.orchestrator.connect("b").await.unwrap();
        a.channels.recv().await.unwrap();

        let first = a.factory.latest("b").await.unwrap();
        first.fail().await;

        // a fresh connection is negotiated and its channel opens
        let again = a.channels.recv().await.unwrap();
        assert_eq!(again.peer_id, "b");
        let connections = a.factory.connections("b").await;
        assert_eq!(connections.len(), 2);
        assert!(first.is_closed().await);
        assert!(connections[1].generation() > first.generation());
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let mut a = node(&hub, &network, "a").await;
        let mut b = node(&hub, &network, "b").await;
        let _stop_a = start(&mut a);
        let _stop_b = start(&mut b);

        a.orchestrator.connect("b").await.unwrap();
        a.channels.recv().await.unwrap();

        network.set_unreachable("b", true).await;
        a.factory.latest("b").await.unwrap().fail().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = a.orchestrator.state("b").await.unwrap();
        assert_eq!(state.phase, SetupPhase::Disconnected);
        assert!(!a.orchestrator.is_ready("b").await);
        assert!(a.orchestrator.channel("b").await.is_none());
        // only the original connection was ever created
        assert_eq!(a.factory.connections("b").await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_peer_fails() {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let a = node(&hub, &network, "a").await;

        assert!(a.orchestrator.connect("ghost").await.is_err());
        assert_eq!(a.orchestrator.state("ghost").await.unwrap().phase, SetupPhase::Disconnected);
        assert!(a.orchestrator.connect("a").await.is_err());
    }
}
