//! Node service: relay connection, peer orchestrator and transfer engine
//! wired together over the local stores.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dbase_config::Config;
use dbase_core::KvRecord;
use dbase_fs::{ChunkFolder, FsChunkStore};
use dbase_webrtc::{
    IceServerProvider, OrchestratorConfig, PeerConnectionFactory,
    PeerOrchestrator, RealPeerConnectionFactory, SignalingClient, SignalingMessage,
    SignalingOptions, SignalingTransport, TransferConfig, TransferEngine, TransferError,
    TurnCredentialsFetcher,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Resolved on-disk locations
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub data_dir: PathBuf,
    pub local_store: PathBuf,
    pub peer_store: PathBuf,
    pub chunk_db: PathBuf,
}

impl NodePaths {
    pub fn from_config(config: &Config, data_dir: PathBuf) -> Self {
        Self {
            local_store: config.storage.local_store_path(&data_dir),
            peer_store: config.storage.peer_store_path(&data_dir),
            chunk_db: data_dir.join("db"),
            data_dir,
        }
    }
}

/// Local stores of a node
pub struct Stores {
    pub chunks: Arc<FsChunkStore>,
    pub local: Arc<ChunkFolder>,
    pub peer: Arc<ChunkFolder>,
}

impl Stores {
    pub fn open(paths: &NodePaths) -> Result<Self> {
        Ok(Self {
            chunks: Arc::new(
                FsChunkStore::new(&paths.chunk_db)
                    .with_context(|| format!("Failed to open chunk store at {}", paths.chunk_db.display()))?,
            ),
            local: Arc::new(
                ChunkFolder::new(&paths.local_store)
                    .with_context(|| format!("Failed to open {}", paths.local_store.display()))?,
            ),
            peer: Arc::new(
                ChunkFolder::new(&paths.peer_store)
                    .with_context(|| format!("Failed to open {}", paths.peer_store.display()))?,
            ),
        })
    }
}

pub fn transfer_config(config: &Config) -> TransferConfig {
    let transfer = &config.transfer;
    TransferConfig {
        max_frame_size: transfer.max_frame_size,
        send_retries: transfer.send_retries,
        open_poll_attempts: transfer.open_poll_attempts,
        open_poll_interval: Duration::from_secs(transfer.open_poll_interval_secs),
        ack_timeout: transfer.ack_timeout_secs.map(Duration::from_secs),
        buffer_high_water: transfer.buffer_high_water,
        drain_timeout: Duration::from_secs(transfer.drain_timeout_secs),
    }
}

pub fn orchestrator_config(config: &Config) -> OrchestratorConfig {
    OrchestratorConfig {
        reconnect_attempts: config.transfer.reconnect_attempts,
        reconnect_interval: Duration::from_secs(config.transfer.reconnect_interval_secs),
    }
}

/// A running node
pub struct Node {
    pub orchestrator: Arc<PeerOrchestrator>,
    pub engine: Arc<TransferEngine>,
    signaling: Option<Arc<SignalingClient>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Connect to the configured relay with webrtc-rs connections
    pub fn start(config: &Config, peer_id: &str, peer_store: Arc<ChunkFolder>) -> Node {
        let (signaling, inbound) = SignalingClient::start(
            peer_id,
            SignalingOptions {
                url: config.server.signaling_url(peer_id),
                ping_interval: Duration::from_secs(config.signaling.ping_interval_secs),
                reconnect_delay: Duration::from_secs(config.signaling.reconnect_delay_secs),
            },
        );
        let ice = Arc::new(TurnCredentialsFetcher::new(
            config.server.credentials_url(),
            Duration::from_millis(config.server.credentials_timeout_ms),
        ));

        let mut node = Self::with_transport(
            signaling.clone(),
            inbound,
            Arc::new(RealPeerConnectionFactory::new()),
            ice,
            peer_store,
            orchestrator_config(config),
            transfer_config(config),
        );
        node.signaling = Some(signaling);
        node
    }

    /// Wire a node over any signaling transport and connection factory
    pub fn with_transport(
        signaling: Arc<dyn SignalingTransport>,
        inbound: mpsc::Receiver<SignalingMessage>,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: Arc<dyn IceServerProvider>,
        peer_store: Arc<ChunkFolder>,
        orchestrator_config: OrchestratorConfig,
        transfer_config: TransferConfig,
    ) -> Node {
        let (orchestrator, channels) = PeerOrchestrator::new(signaling, factory, ice, orchestrator_config);
        let engine = TransferEngine::new(orchestrator.clone(), peer_store, transfer_config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(orchestrator.clone().run(inbound, shutdown_rx));
        tokio::spawn(engine.clone().run(channels));

        Node {
            orchestrator,
            engine,
            signaling: None,
            shutdown_tx,
        }
    }

    pub fn local_peer_id(&self) -> &str {
        self.orchestrator.local_peer_id()
    }

    /// Wait for the relay socket; true once it is open
    pub async fn wait_signaling(&self, timeout: Duration) -> bool {
        match &self.signaling {
            Some(signaling) => signaling.wait_open(timeout).await,
            None => true,
        }
    }

    /// Send `records` to every peer, one session each.
    ///
    /// Failures are logged per peer and never abort the others.
    pub async fn replicate(&self, peers: &[String], records: &[KvRecord]) -> Vec<(String, Result<usize, TransferError>)> {
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer == self.local_peer_id() {
                continue;
            }
            let result = self.engine.send_records(peer, records).await;
            match &result {
                Ok(n) => info!("Replicated {} records to {}", n, peer),
                Err(e) => warn!("Replication to {} failed: {}", peer, e),
            }
            results.push((peer.clone(), result));
        }
        results
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.shutdown_tx.send_replace(true);
        if let Some(signaling) = &self.signaling {
            signaling.shutdown();
        }
    }
}
