//! Chunk and file-metadata store interface and in-memory implementation

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{Chunk, FileMetadata};

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Metadata for file {0} already exists")]
    DuplicateFile(String),
    #[error("Store error: {0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Other("store lock poisoned".to_string())
    }
}

/// Persistent home of chunks and per-file metadata.
///
/// Chunks are keyed by `(file_id, chunk_index)`; putting the same key twice
/// overwrites. Metadata is keyed by `file_id` and is immutable once added.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store (or overwrite) a chunk
    async fn put(&self, chunk: Chunk) -> Result<(), StoreError>;

    /// All chunks of a file, ascending by index
    async fn get_chunks_for_file(&self, file_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Remove metadata and every chunk of a file
    async fn delete_file(&self, file_id: &str) -> Result<(), StoreError>;

    /// All metadata records
    async fn list_metadata(&self) -> Result<Vec<FileMetadata>, StoreError>;

    /// Add a metadata record. Fails if the file id is taken.
    async fn add_metadata(&self, meta: FileMetadata) -> Result<(), StoreError>;

    /// Number of metadata records
    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.list_metadata().await?.len())
    }

    /// Metadata for one file
    async fn get_metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, StoreError> {
        Ok(self
            .list_metadata()
            .await?
            .into_iter()
            .find(|m| m.file_id == file_id))
    }

    /// Next file id: max numeric id + 1, starting at 1.
    ///
    /// Not safe under concurrent writers; two uploads racing here can pick
    /// the same id and the second `add_metadata` fails.
    async fn next_file_id(&self) -> Result<String, StoreError> {
        Ok(next_file_id(&self.list_metadata().await?))
    }
}

/// Allocate the next file id from existing metadata
pub fn next_file_id(existing: &[FileMetadata]) -> String {
    let max = existing
        .iter()
        .filter_map(|m| m.file_id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

#[derive(Debug, Default)]
struct MemoryChunkStoreInner {
    chunks: HashMap<String, BTreeMap<u32, Chunk>>,
    metadata: BTreeMap<String, FileMetadata>,
}

/// In-memory chunk store
#[derive(Debug, Clone, Default)]
pub struct MemoryChunkStore {
    inner: Arc<RwLock<MemoryChunkStoreInner>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total chunks held, across all files
    pub fn chunk_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.chunks.values().map(|c| c.len()).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, chunk: Chunk) -> Result<(), StoreError> {
        let mut inner = self.inner.write()?;
        inner
            .chunks
            .entry(chunk.file_id.clone())
            .or_default()
            .insert(chunk.chunk_index, chunk);
        Ok(())
    }

    async fn get_chunks_for_file(&self, file_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let inner = self.inner.read()?;
        Ok(inner
            .chunks
            .get(file_id)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write()?;
        inner.metadata.remove(file_id);
        inner.chunks.remove(file_id);
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<FileMetadata>, StoreError> {
        Ok(self.inner.read()?.metadata.values().cloned().collect())
    }

    async fn add_metadata(&self, meta: FileMetadata) -> Result<(), StoreError> {
        let mut inner = self.inner.write()?;
        if inner.metadata.contains_key(&meta.file_id) {
            return Err(StoreError::DuplicateFile(meta.file_id));
        }
        inner.metadata.insert(meta.file_id.clone(), meta);
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read()?.metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncryptedChunk, EncryptionMethod};

    fn chunk(file_id: &str, index: u32) -> Chunk {
        Chunk {
            owner: "owner".to_string(),
            file_id: file_id.to_string(),
            file_name: format!("file-{file_id}"),
            chunk_index: index,
            chunk_cid: format!("cid-{file_id}-{index}"),
            payload: EncryptedChunk::plain(vec![index as u8]),
            encryption_method: EncryptionMethod::None,
        }
    }

    fn meta(file_id: &str, num_chunks: u32) -> FileMetadata {
        FileMetadata {
            owner: "owner".to_string(),
            file_id: file_id.to_string(),
            file_name: format!("file-{file_id}"),
            file_size: 10,
            num_chunks,
            encryption_method: EncryptionMethod::None,
        }
    }

    #[test]
    fn test_next_file_id() {
        assert_eq!(next_file_id(&[]), "1");
        assert_eq!(next_file_id(&[meta("3", 1), meta("10", 1), meta("7", 1)]), "11");
        assert_eq!(next_file_id(&[meta("not-a-number", 1)]), "1");
    }

    #[tokio::test]
    async fn test_chunks_sorted_regardless_of_put_order() {
        let store = MemoryChunkStore::new();
        for i in [2, 0, 1] {
            store.put(chunk("1", i)).await.unwrap();
        }
        let indices: Vec<u32> = store
            .get_chunks_for_file("1")
            .await
            .unwrap()
            .iter()
            .map(|c| c.chunk_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_delete_file_removes_everything() {
        let store = MemoryChunkStore::new();
        store.put(chunk("1", 0)).await.unwrap();
        store.put(chunk("2", 0)).await.unwrap();
        store.add_metadata(meta("1", 1)).await.unwrap();
        store.add_metadata(meta("2", 1)).await.unwrap();

        store.delete_file("1").await.unwrap();

        assert!(store.get_chunks_for_file("1").await.unwrap().is_empty());
        let ids: Vec<String> = store
            .list_metadata()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.file_id)
            .collect();
        assert_eq!(ids, vec!["2".to_string()]);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_metadata_rejected() {
        let store = MemoryChunkStore::new();
        store.add_metadata(meta("1", 1)).await.unwrap();
        assert!(matches!(
            store.add_metadata(meta("1", 2)).await,
            Err(StoreError::DuplicateFile(id)) if id == "1"
        ));
    }

    #[tokio::test]
    async fn test_next_file_id_from_store() {
        let store = MemoryChunkStore::new();
        assert_eq!(store.next_file_id().await.unwrap(), "1");
        store.add_metadata(meta("1", 1)).await.unwrap();
        assert_eq!(store.next_file_id().await.unwrap(), "2");
        assert_eq!(store.get_metadata("1").await.unwrap().unwrap().num_chunks, 1);
    }
}
