//! Encode -> store -> decode through the in-memory chunk store

use dbase_core::{
    codec, decode_chunks, generate_key, next_file_id, sort_by_index, Chunk, ChunkStore,
    CodecError, EncryptionMethod, FileMetadata, MemoryChunkStore, DEFAULT_CHUNK_SIZE,
};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8 ^ (i / 253) as u8).collect()
}

async fn store_file(store: &MemoryChunkStore, name: &str, data: &[u8], method: EncryptionMethod) -> (String, Vec<Chunk>) {
    let key = generate_key();
    let key_ref = method.is_encrypted().then_some(&key);
    let file_id = store.next_file_id().await.unwrap();

    let mut chunks = Vec::new();
    for encoded in codec::encode(data, key_ref, DEFAULT_CHUNK_SIZE).unwrap() {
        let encoded = encoded.unwrap();
        chunks.push(Chunk {
            owner: "node-a".to_string(),
            file_id: file_id.clone(),
            file_name: name.to_string(),
            chunk_index: encoded.chunk_index,
            chunk_cid: encoded.chunk_cid,
            payload: encoded.payload,
            encryption_method: method,
        });
    }

    // store out of order; the store returns index order
    for chunk in chunks.iter().rev() {
        store.put(chunk.clone()).await.unwrap();
    }
    store
        .add_metadata(FileMetadata {
            owner: "node-a".to_string(),
            file_id: file_id.clone(),
            file_name: name.to_string(),
            file_size: data.len() as u64,
            num_chunks: chunks.len() as u32,
            encryption_method: method,
        })
        .await
        .unwrap();

    (file_id, chunks)
}

#[tokio::test]
async fn test_300k_file_three_chunks() {
    let store = MemoryChunkStore::new();
    let data = sample(300 * 1024);
    let (file_id, chunks) = store_file(&store, "big.bin", &data, EncryptionMethod::AesGcm).await;

    assert_eq!(file_id, "1");
    assert_eq!(chunks.len(), 3);
    let mut cids: Vec<_> = chunks.iter().map(|c| c.chunk_cid.clone()).collect();
    cids.dedup();
    assert_eq!(cids.len(), 3);

    let metas = store.list_metadata().await.unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].num_chunks, 3);
    assert_eq!(metas[0].file_size, 300 * 1024);
}

#[tokio::test]
async fn test_roundtrip_unencrypted_via_store() {
    let store = MemoryChunkStore::new();
    let data = sample(200 * 1024 + 17);
    let (file_id, _) = store_file(&store, "plain.bin", &data, EncryptionMethod::None).await;

    let chunks = store.get_chunks_for_file(&file_id).await.unwrap();
    assert_eq!(decode_chunks(&chunks, None).unwrap(), data);
}

#[tokio::test]
async fn test_shuffled_chunks_need_sorting() {
    let data = sample(3 * 1024);
    let mut chunks: Vec<Chunk> = codec::encode(&data[..], None, 1024)
        .unwrap()
        .map(|c| {
            let c = c.unwrap();
            Chunk {
                owner: "o".to_string(),
                file_id: "1".to_string(),
                file_name: "f".to_string(),
                chunk_index: c.chunk_index,
                chunk_cid: c.chunk_cid,
                payload: c.payload,
                encryption_method: EncryptionMethod::None,
            }
        })
        .collect();

    // [2, 0, 1]
    chunks.rotate_right(1);
    assert!(matches!(
        decode_chunks(&chunks, None),
        Err(CodecError::OutOfOrder { .. })
    ));

    sort_by_index(&mut chunks);
    assert_eq!(decode_chunks(&chunks, None).unwrap(), data);
}

#[tokio::test]
async fn test_delete_then_list() {
    let store = MemoryChunkStore::new();
    let (first, _) = store_file(&store, "a.txt", b"first file", EncryptionMethod::None).await;
    let (second, _) = store_file(&store, "b.txt", b"second file", EncryptionMethod::None).await;
    assert_eq!(second, "2");

    store.delete_file(&first).await.unwrap();

    let remaining = store.list_metadata().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].file_id, second);
    assert!(store.get_chunks_for_file(&first).await.unwrap().is_empty());
    assert_eq!(next_file_id(&remaining), "3");
}
