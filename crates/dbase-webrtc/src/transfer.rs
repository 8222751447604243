//! Transfer protocol engine
//!
//! Sends chunk records to a peer over its data channel and commits records
//! received from peers to the peer chunk folder.
//!
//! A send session is: `file_transfer_info` with a fresh transfer id, wait for
//! the matching `file_transfer_info_ack`, then every record as binary frames.
//! Sessions to the same peer never overlap, and a session is complete only
//! once the channel has flushed its last frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dbase_core::{KvRecord, StoreError};
use dbase_fs::ChunkFolder;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::orchestrator::{ChannelAvailable, PeerOrchestrator};
use crate::protocol::{frame_record, ControlMessage, Reassembler, MAX_FRAME_SIZE};
use crate::transport::{ChannelFrame, DataChannel, NegotiationError, ProtocolError, TransportError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Peer {peer_id} unreachable after {attempts} attempts")]
    Unreachable { peer_id: String, attempts: u32 },
    #[error("Transfer engine shut down")]
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_frame_size: usize,
    /// Extra rounds of (reconnect, poll) when no channel is open
    pub send_retries: u32,
    pub open_poll_attempts: u32,
    pub open_poll_interval: Duration,
    /// `None` waits for the handshake ack indefinitely
    pub ack_timeout: Option<Duration>,
    /// Stop sending while more than this many bytes are queued on the channel
    pub buffer_high_water: usize,
    /// Longest wait for the channel's send queue to drain
    pub drain_timeout: Duration,
}

/// Polling interval while waiting on a channel's send queue
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            send_retries: 3,
            open_poll_attempts: 10,
            open_poll_interval: Duration::from_secs(60),
            ack_timeout: None,
            buffer_high_water: 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Progress and delivery notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    SessionStarted { peer_id: String, transfer_id: String, records: usize },
    RecordSent { peer_id: String, transfer_id: String, sent: usize, total: usize },
    SessionFinished { peer_id: String, transfer_id: String, records: usize },
    RecordStored { peer_id: String, key: String },
    TextReceived { peer_id: String, content: String },
}

/// Called with (peer id, text content) for every `text` control message
pub type TextCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Called with (peer id, chunk CID) after a received record is committed
pub type RecordCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct PendingAck {
    channel: Arc<dyn DataChannel>,
    tx: oneshot::Sender<()>,
}

pub struct TransferEngine {
    local_peer_id: String,
    orchestrator: Arc<PeerOrchestrator>,
    peer_store: Arc<ChunkFolder>,
    config: TransferConfig,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    sessions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    text_callback: RwLock<Option<TextCallback>>,
    record_callback: RwLock<Option<RecordCallback>>,
    events: broadcast::Sender<TransferEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl TransferEngine {
    pub fn new(
        orchestrator: Arc<PeerOrchestrator>,
        peer_store: Arc<ChunkFolder>,
        config: TransferConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            local_peer_id: orchestrator.local_peer_id().to_string(),
            orchestrator,
            peer_store,
            config,
            pending_acks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            text_callback: RwLock::new(None),
            record_callback: RwLock::new(None),
            events,
            shutdown_tx,
        })
    }

    pub async fn on_text(&self, callback: TextCallback) {
        *self.text_callback.write().await = Some(callback);
    }

    pub async fn on_record(&self, callback: RecordCallback) {
        *self.record_callback.write().await = Some(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Stop retry loops and pending waits
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn emit(&self, event: TransferEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Attach a reader to every channel the orchestrator opens
    pub async fn run(self: Arc<Self>, mut channels: mpsc::Receiver<ChannelAvailable>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                available = channels.recv() => {
                    let Some(available) = available else { break };
                    self.attach_channel(&available.peer_id, available.channel);
                }
            }
        }
        debug!("Transfer engine stopped");
    }

    /// Spawn the read loop for one channel
    pub fn attach_channel(self: &Arc<Self>, peer_id: &str, channel: Arc<dyn DataChannel>) {
        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move { this.read_loop(peer_id, channel).await });
    }

    async fn read_loop(self: Arc<Self>, peer_id: String, channel: Arc<dyn DataChannel>) {
        debug!("Reading channel '{}' from {}", channel.label(), peer_id);
        let mut reassembler = Reassembler::default();

        while let Some(frame) = channel.recv().await {
            match frame {
                ChannelFrame::Text(text) => self.handle_control(&peer_id, &channel, &text).await,
                ChannelFrame::Binary(bytes) => match reassembler.push(&bytes) {
                    Ok(Some(record)) => {
                        if let Err(e) = self.commit(&peer_id, record).await {
                            error!("Failed to store record from {}: {}", peer_id, e);
                        }
                    }
                    Ok(None) => debug!(
                        "Frame of {} bytes from {}, {} buffered",
                        bytes.len(),
                        peer_id,
                        reassembler.pending()
                    ),
                    Err(e) => warn!("Dropping frames from {}: {}", peer_id, e),
                },
            }
        }

        if reassembler.pending() > 0 {
            warn!(
                "Channel from {} closed with {} bytes of an unfinished record",
                peer_id,
                reassembler.pending()
            );
        }
        // waiters on this channel will never see their ack
        self.pending_acks
            .lock()
            .await
            .retain(|_, pending| pending.channel.is_open());
        debug!("Channel '{}' from {} closed", channel.label(), peer_id);
    }

    async fn handle_control(&self, peer_id: &str, channel: &Arc<dyn DataChannel>, text: &str) {
        let msg = match ControlMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping control message from {}: {}", peer_id, e);
                return;
            }
        };

        match msg {
            ControlMessage::FileTransferInfo {
                transfer_id,
                source_id,
                kv_pairs_length,
                max_chunk_size,
            } => {
                info!(
                    "Transfer {} from {}: {} records, frames up to {} bytes",
                    transfer_id, source_id, kv_pairs_length, max_chunk_size
                );
                let ack = ControlMessage::FileTransferInfoAck { transfer_id };
                match ack.to_json() {
                    Ok(json) => {
                        if let Err(e) = channel.send_text(&json).await {
                            warn!("Failed to ack transfer from {}: {}", peer_id, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode ack: {}", e),
                }
            }
            ControlMessage::FileTransferInfoAck { transfer_id } => {
                match self.pending_acks.lock().await.remove(&transfer_id) {
                    Some(pending) => {
                        debug!("Transfer {} acknowledged by {}", transfer_id, peer_id);
                        let _ = pending.tx.send(());
                    }
                    None => debug!("Ignoring ack for unknown transfer {} from {}", transfer_id, peer_id),
                }
            }
            ControlMessage::Text { content } => {
                debug!("Text message from {} ({} bytes)", peer_id, content.len());
                if let Some(callback) = self.text_callback.read().await.clone() {
                    callback(peer_id, &content);
                }
                self.emit(TransferEvent::TextReceived {
                    peer_id: peer_id.to_string(),
                    content,
                });
            }
        }
    }

    async fn commit(&self, peer_id: &str, record: KvRecord) -> Result<(), StoreError> {
        self.peer_store.store_received(&record.key, &record.value)?;
        info!(
            "Stored chunk {} of {} from {}",
            record.value.chunk_index, record.value.file_name, peer_id
        );
        if let Some(callback) = self.record_callback.read().await.clone() {
            callback(peer_id, &record.key);
        }
        self.emit(TransferEvent::RecordStored {
            peer_id: peer_id.to_string(),
            key: record.key,
        });
        Ok(())
    }

    /// An open channel to `peer_id`, connecting and polling if needed.
    ///
    /// Each round asks the orchestrator to (re)connect, then polls for an
    /// open channel; `send_retries` extra rounds are made before giving up.
    pub async fn acquire_channel(&self, peer_id: &str) -> Result<Arc<dyn DataChannel>, TransferError> {
        let rounds = self.config.send_retries + 1;
        for round in 1..=rounds {
            if let Some(channel) = self.orchestrator.channel(peer_id).await {
                return Ok(channel);
            }
            if self.is_shutdown() {
                return Err(TransferError::Shutdown);
            }

            info!("No open channel to {}, connecting (round {}/{})", peer_id, round, rounds);
            if let Err(e) = self.orchestrator.connect(peer_id).await {
                warn!("Connecting to {} failed: {}", peer_id, e);
            }

            for _ in 0..self.config.open_poll_attempts {
                tokio::time::sleep(self.config.open_poll_interval).await;
                if self.is_shutdown() {
                    return Err(TransferError::Shutdown);
                }
                if let Some(channel) = self.orchestrator.channel(peer_id).await {
                    return Ok(channel);
                }
            }
            warn!("Channel to {} still closed, {} rounds left", peer_id, rounds - round);
        }

        error!("Giving up on {}: no open channel", peer_id);
        Err(TransferError::Unreachable {
            peer_id: peer_id.to_string(),
            attempts: rounds,
        })
    }

    async fn session_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        self.sessions
            .lock()
            .await
            .entry(peer_id.to_string())
            .or_default()
            .clone()
    }

    /// Replicate records to one peer; returns how many were sent
    pub async fn send_records(&self, peer_id: &str, records: &[KvRecord]) -> Result<usize, TransferError> {
        let channel = self.acquire_channel(peer_id).await?;
        self.send_over(peer_id, &channel, records).await
    }

    /// Run one handshake-gated session over `channel`.
    ///
    /// Frames are paced by the channel's send queue, and the call returns
    /// only after that queue has drained.
    pub async fn send_over(
        &self,
        peer_id: &str,
        channel: &Arc<dyn DataChannel>,
        records: &[KvRecord],
    ) -> Result<usize, TransferError> {
        let lock = self.session_lock(peer_id).await;
        let result = {
            let _session = lock.lock().await;
            self.run_session(peer_id, channel, records).await
        };
        self.release_session(peer_id, lock).await;
        result
    }

    /// Forget the session lock of `peer_id` once nobody else holds it
    async fn release_session(&self, peer_id: &str, lock: Arc<Mutex<()>>) {
        let mut sessions = self.sessions.lock().await;
        let idle = sessions
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            sessions.remove(peer_id);
        }
    }

    async fn run_session(
        &self,
        peer_id: &str,
        channel: &Arc<dyn DataChannel>,
        records: &[KvRecord],
    ) -> Result<usize, TransferError> {
        let transfer_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(
            transfer_id.clone(),
            PendingAck {
                channel: channel.clone(),
                tx,
            },
        );

        let info = ControlMessage::FileTransferInfo {
            transfer_id: transfer_id.clone(),
            source_id: self.local_peer_id.clone(),
            kv_pairs_length: records.len(),
            max_chunk_size: self.config.max_frame_size,
        };
        let sent = match info.to_json() {
            Ok(json) => channel.send_text(&json).await.map_err(TransferError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.pending_acks.lock().await.remove(&transfer_id);
            return Err(e);
        }
        info!("Transfer {} to {}: {} records, awaiting ack", transfer_id, peer_id, records.len());
        self.emit(TransferEvent::SessionStarted {
            peer_id: peer_id.to_string(),
            transfer_id: transfer_id.clone(),
            records: records.len(),
        });

        if let Err(e) = self.wait_ack(rx).await {
            self.pending_acks.lock().await.remove(&transfer_id);
            warn!("Transfer {} to {} not acknowledged: {}", transfer_id, peer_id, e);
            return Err(e);
        }

        for (i, record) in records.iter().enumerate() {
            let frames = frame_record(record, self.config.max_frame_size)?;
            let count = frames.len();
            for frame in frames {
                let limit = self.config.buffer_high_water.saturating_sub(frame.len());
                if !self.wait_buffered(channel, limit).await? {
                    warn!("Send queue to {} above {} bytes, sending anyway", peer_id, limit);
                }
                channel.send_binary(&frame).await?;
            }
            debug!("Sent record {} to {} in {} frames", record.key, peer_id, count);
            self.emit(TransferEvent::RecordSent {
                peer_id: peer_id.to_string(),
                transfer_id: transfer_id.clone(),
                sent: i + 1,
                total: records.len(),
            });
        }

        // the records are only delivered once the queue is empty
        if !self.wait_buffered(channel, 0).await? {
            warn!("Transfer {} to {}: send queue did not drain", transfer_id, peer_id);
            return Err(TransportError::Timeout.into());
        }

        info!("Transfer {} to {} complete", transfer_id, peer_id);
        self.emit(TransferEvent::SessionFinished {
            peer_id: peer_id.to_string(),
            transfer_id,
            records: records.len(),
        });
        Ok(records.len())
    }

    /// Wait until at most `limit` bytes are queued on `channel`.
    ///
    /// `Ok(false)` when `drain_timeout` passed first.
    async fn wait_buffered(&self, channel: &Arc<dyn DataChannel>, limit: usize) -> Result<bool, TransferError> {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            if !channel.is_open() {
                return Err(TransportError::Disconnected.into());
            }
            if self.is_shutdown() {
                return Err(TransferError::Shutdown);
            }
            let buffered = channel.buffered_amount().await;
            if buffered <= limit {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!("{} bytes still queued on '{}'", buffered, channel.label());
                return Ok(false);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn wait_ack(&self, rx: oneshot::Receiver<()>) -> Result<(), TransferError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let ack = async {
            match self.config.ack_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                    Ok(result) => result.map_err(|_| TransportError::Disconnected),
                    Err(_) => Err(TransportError::Timeout),
                },
                None => rx.await.map_err(|_| TransportError::Disconnected),
            }
        };
        tokio::select! {
            result = ack => result.map_err(TransferError::from),
            _ = shutdown.wait_for(|stop| *stop) => Err(TransferError::Shutdown),
        }
    }

    /// Send a `text` control message
    pub async fn send_text(&self, peer_id: &str, content: &str) -> Result<(), TransferError> {
        let channel = self.acquire_channel(peer_id).await?;
        let json = ControlMessage::Text {
            content: content.to_string(),
        }
        .to_json()?;
        channel.send_text(&json).await?;
        if !self.wait_buffered(&channel, 0).await? {
            return Err(TransportError::Timeout.into());
        }
        debug!("Text message sent to {}", peer_id);
        Ok(())
    }
}
