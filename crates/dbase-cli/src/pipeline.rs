//! Upload and download pipelines
//!
//! Upload encodes a file slice by slice, writes every chunk to the chunk
//! store and the local chunk folder, and adds the file metadata only once
//! all chunks are written. Replication records are collected on the way.

use std::io::Read;

use anyhow::{bail, Context, Result};
use dbase_core::{
    codec, ChunkStore, Chunk, EncryptionKey, EncryptionMethod, FileMetadata, KvRecord,
};
use dbase_fs::{ChunkFolder, ReceivedFile};
use tracing::{debug, info};

/// Parameters of one upload
#[derive(Clone)]
pub struct UploadOptions {
    pub owner: String,
    /// `None` stores compressed chunks unencrypted
    pub key: Option<EncryptionKey>,
    pub chunk_size: usize,
    /// Collect `{key, value}` records for peer replication
    pub replicate: bool,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub metadata: FileMetadata,
    /// Replication records in chunk order; empty unless requested
    pub records: Vec<KvRecord>,
}

/// Upload progress in percent, capped at 100
fn progress_percent(offset: u64, file_size: u64) -> f64 {
    if file_size == 0 {
        return 100.0;
    }
    (offset as f64 / file_size as f64 * 100.0).min(100.0)
}

/// Encode `reader` and persist it under a fresh file id.
///
/// `progress` is called after each chunk with the percentage of `file_size`
/// consumed so far.
pub async fn process_and_store_file<R: Read>(
    reader: R,
    file_name: &str,
    file_size: u64,
    store: &dyn ChunkStore,
    local: &ChunkFolder,
    options: &UploadOptions,
    mut progress: impl FnMut(f64),
) -> Result<UploadResult> {
    let file_id = store.next_file_id().await?;
    let encryption_method = if options.key.is_some() {
        EncryptionMethod::AesGcm
    } else {
        EncryptionMethod::None
    };
    info!(
        "Storing {} as file {} ({} bytes, {})",
        file_name, file_id, file_size, encryption_method
    );

    let mut records = Vec::new();
    let mut num_chunks = 0u32;
    let mut offset = 0u64;

    for encoded in codec::encode(reader, options.key.as_ref(), options.chunk_size)? {
        let encoded = encoded.with_context(|| format!("Failed to encode chunk {} of {}", num_chunks, file_name))?;
        let chunk = Chunk {
            owner: options.owner.clone(),
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
            chunk_index: encoded.chunk_index,
            chunk_cid: encoded.chunk_cid,
            payload: encoded.payload,
            encryption_method,
        };

        store.put(chunk.clone()).await?;
        local
            .save_chunk(file_name, chunk.chunk_index, &chunk.payload)
            .with_context(|| format!("Failed to write chunk {} to local store", chunk.chunk_index))?;
        debug!("Stored chunk {} ({})", chunk.chunk_index, chunk.chunk_cid);

        if options.replicate {
            records.push(KvRecord::new(chunk.to_meta()));
        }

        num_chunks += 1;
        offset += options.chunk_size as u64;
        progress(progress_percent(offset, file_size));
    }

    // only after every chunk is durable
    let metadata = FileMetadata {
        owner: options.owner.clone(),
        file_id,
        file_name: file_name.to_string(),
        file_size,
        num_chunks,
        encryption_method,
    };
    store.add_metadata(metadata.clone()).await?;
    info!("Stored {} in {} chunks", metadata.file_name, num_chunks);

    Ok(UploadResult { metadata, records })
}

/// Reassemble a file from the chunk store
pub async fn download_file(
    store: &dyn ChunkStore,
    file_id: &str,
    key: Option<&EncryptionKey>,
    mut progress: impl FnMut(f64),
) -> Result<Vec<u8>> {
    let mut chunks = store.get_chunks_for_file(file_id).await?;
    if chunks.is_empty() {
        bail!("No chunks found for file {}", file_id);
    }
    if let Some(meta) = store.get_metadata(file_id).await? {
        if meta.num_chunks as usize != chunks.len() {
            bail!(
                "File {} has {} of {} chunks",
                file_id,
                chunks.len(),
                meta.num_chunks
            );
        }
    }
    codec::sort_by_index(&mut chunks);

    let total = chunks.len();
    let mut out = Vec::new();
    for (done, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_index as usize != done {
            bail!("File {} is missing chunk {}", file_id, done);
        }
        let bytes = codec::decode_chunk(chunk.chunk_index, &chunk.payload, key)?;
        out.extend_from_slice(&bytes);
        progress((done + 1) as f64 / total as f64 * 100.0);
    }
    info!("Restored file {} ({} bytes)", file_id, out.len());
    Ok(out)
}

/// Reassemble a file from one folder of a chunk folder store
pub fn download_folder_file(
    folder: &ChunkFolder,
    name: &str,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    let chunks = folder
        .read_chunks(name)
        .with_context(|| format!("Failed to read folder {}", name))?;
    if chunks.is_empty() {
        bail!("Folder {} holds no chunks", name);
    }
    let data = codec::decode(chunks.iter().map(|(index, chunk)| (*index, chunk)), key)?;
    Ok(data)
}

/// Reassemble a file received from a peer, gathered across CID folders
pub fn download_received_file(
    folder: &ChunkFolder,
    file: &ReceivedFile,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    let chunks = folder.read_received(file)?;
    let data = codec::decode(chunks.iter().map(|(index, chunk)| (*index, chunk)), key)
        .with_context(|| format!("Failed to decode {} from {}", file.file_name, file.owner))?;
    Ok(data)
}
