//! Upload on one node, replicate to another, restore from its peer store.

use std::sync::Arc;
use std::time::Duration;

use dbase_cli::{download_received_file, process_and_store_file, Node, UploadOptions};
use dbase_core::{crypto, ChunkStore, MemoryChunkStore};
use dbase_fs::ChunkFolder;
use dbase_webrtc::mock::{MockNetwork, MockSignalingHub};
use dbase_webrtc::{OrchestratorConfig, StaticIceServers, TransferConfig};
use tempfile::TempDir;

async fn node(
    hub: &Arc<MockSignalingHub>,
    network: &Arc<MockNetwork>,
    id: &str,
    peer_store: Arc<ChunkFolder>,
) -> Node {
    let (signaling, inbound) = hub.register(id).await;
    Node::with_transport(
        signaling,
        inbound,
        network.factory(id),
        Arc::new(StaticIceServers(Vec::new())),
        peer_store,
        OrchestratorConfig {
            reconnect_attempts: 1,
            reconnect_interval: Duration::from_millis(10),
        },
        TransferConfig {
            send_retries: 0,
            open_poll_attempts: 100,
            open_poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_upload_replicate_restore() {
    let temp = TempDir::new().unwrap();
    let hub = MockSignalingHub::new();
    let network = MockNetwork::new();

    let a_local = ChunkFolder::new(temp.path().join("a/local_store")).unwrap();
    let a_peer = Arc::new(ChunkFolder::new(temp.path().join("a/peer_store")).unwrap());
    let b_peer = Arc::new(ChunkFolder::new(temp.path().join("b/peer_store")).unwrap());
    let a = node(&hub, &network, "node-a", a_peer).await;
    let b = node(&hub, &network, "node-b", b_peer.clone()).await;

    let store = MemoryChunkStore::new();
    let key = crypto::derive_key_from_password("s3cret");
    let data: Vec<u8> = (0..300 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();

    let upload = process_and_store_file(
        &data[..],
        "holiday.mov",
        data.len() as u64,
        &store,
        &a_local,
        &UploadOptions {
            owner: "node-a".to_string(),
            key: Some(key),
            chunk_size: 128 * 1024,
            replicate: true,
        },
        |_| {},
    )
    .await
    .unwrap();
    assert_eq!(upload.metadata.num_chunks, 3);
    assert_eq!(store.count().await.unwrap(), 1);

    let peers = vec!["node-a".to_string(), "node-b".to_string()];
    let results = a.replicate(&peers, &upload.records).await;
    // self is skipped
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "node-b");
    assert_eq!(*results[0].1.as_ref().unwrap(), 3);

    let mut files = Vec::new();
    for _ in 0..200 {
        files = b_peer.received_files().unwrap();
        if files.len() == 1 && files[0].chunks.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].owner, "node-a");
    assert_eq!(files[0].file_name, "holiday.mov");
    assert_eq!(files[0].chunks.len(), 3);

    let restored = download_received_file(&b_peer, &files[0], Some(&key)).unwrap();
    assert_eq!(restored, data);

    // folder listing on the receiver picks the owner up from the sidecars
    let entries = b_peer.list().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.owner.as_deref() == Some("node-a")));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_replicate_reports_unreachable_peer() {
    let temp = TempDir::new().unwrap();
    let hub = MockSignalingHub::new();
    let network = MockNetwork::new();
    let peer_store = Arc::new(ChunkFolder::new(temp.path().join("peer_store")).unwrap());
    let a = node(&hub, &network, "node-a", peer_store).await;

    let results = a.replicate(&["missing".to_string()], &[]).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "missing");
    assert!(matches!(
        results[0].1,
        Err(dbase_webrtc::TransferError::Unreachable { attempts: 1, .. })
    ));

    a.shutdown();
}
