//! Persistent [`ChunkStore`] on the local filesystem
//!
//! ```text
//! {base}/metadata/{fileId}.json
//! {base}/chunks/{fileId}/{chunkIndex}.json
//! ```

use async_trait::async_trait;
use dbase_core::{Chunk, ChunkStore, FileMetadata, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::folder::write_atomic;

pub struct FsChunkStore {
    base_path: PathBuf,
    /// Serializes metadata insertion so the duplicate check is atomic
    metadata_lock: Mutex<()>,
}

impl FsChunkStore {
    /// Open a store at `path`, creating the layout if needed
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(base_path.join("metadata"))?;
        fs::create_dir_all(base_path.join("chunks"))?;
        Ok(Self {
            base_path,
            metadata_lock: Mutex::new(()),
        })
    }

    fn metadata_path(&self, file_id: &str) -> Result<PathBuf, StoreError> {
        check_file_id(file_id)?;
        Ok(self.base_path.join("metadata").join(format!("{}.json", file_id)))
    }

    fn chunk_dir(&self, file_id: &str) -> Result<PathBuf, StoreError> {
        check_file_id(file_id)?;
        Ok(self.base_path.join("chunks").join(file_id))
    }
}

fn check_file_id(file_id: &str) -> Result<(), StoreError> {
    if file_id.is_empty() || !file_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(StoreError::Other(format!("invalid file id: {:?}", file_id)));
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn put(&self, chunk: Chunk) -> Result<(), StoreError> {
        let dir = self.chunk_dir(&chunk.file_id)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", chunk.chunk_index));
        write_atomic(&path, &serde_json::to_vec(&chunk)?)
    }

    async fn get_chunks_for_file(&self, file_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let dir = self.chunk_dir(file_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let chunk: Chunk = serde_json::from_slice(&fs::read(&path)?)?;
            chunks.push(chunk);
        }
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), StoreError> {
        let meta = self.metadata_path(file_id)?;
        if meta.exists() {
            fs::remove_file(&meta)?;
        }
        // a crash here leaves orphan chunks, which nothing reads without metadata
        let dir = self.chunk_dir(file_id)?;
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<FileMetadata>, StoreError> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(self.base_path.join("metadata"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            metas.push(serde_json::from_slice::<FileMetadata>(&fs::read(&path)?)?);
        }
        metas.sort_by_key(|m| m.file_id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(metas)
    }

    async fn add_metadata(&self, meta: FileMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(&meta.file_id)?;
        let _guard = self.metadata_lock.lock()?;
        if path.exists() {
            return Err(StoreError::DuplicateFile(meta.file_id));
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&meta)?)
    }

    async fn get_metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, StoreError> {
        let path = self.metadata_path(file_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(&path)?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbase_core::{EncryptedChunk, EncryptionMethod};
    use tempfile::TempDir;

    fn chunk(file_id: &str, index: u32) -> Chunk {
        Chunk {
            owner: "me".to_string(),
            file_id: file_id.to_string(),
            file_name: "doc.txt".to_string(),
            chunk_index: index,
            chunk_cid: format!("cid{index}"),
            payload: EncryptedChunk::plain(vec![index as u8; 4]),
            encryption_method: EncryptionMethod::None,
        }
    }

    fn meta(file_id: &str) -> FileMetadata {
        FileMetadata {
            owner: "me".to_string(),
            file_id: file_id.to_string(),
            file_name: "doc.txt".to_string(),
            file_size: 8,
            num_chunks: 2,
            encryption_method: EncryptionMethod::None,
        }
    }

    #[tokio::test]
    async fn test_put_get_persists() {
        let temp = TempDir::new().unwrap();
        {
            let store = FsChunkStore::new(temp.path()).unwrap();
            store.put(chunk("1", 1)).await.unwrap();
            store.put(chunk("1", 0)).await.unwrap();
            store.add_metadata(meta("1")).await.unwrap();
        }

        let store = FsChunkStore::new(temp.path()).unwrap();
        let chunks = store.get_chunks_for_file("1").await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], chunk("1", 0));
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.next_file_id().await.unwrap(), "2");
        assert_eq!(store.get_metadata("1").await.unwrap(), Some(meta("1")));
    }

    #[tokio::test]
    async fn test_delete_file() {
        let temp = TempDir::new().unwrap();
        let store = FsChunkStore::new(temp.path()).unwrap();
        store.put(chunk("1", 0)).await.unwrap();
        store.add_metadata(meta("1")).await.unwrap();

        store.delete_file("1").await.unwrap();
        assert!(store.list_metadata().await.unwrap().is_empty());
        assert!(store.get_chunks_for_file("1").await.unwrap().is_empty());
        // deleting again is a no-op
        store.delete_file("1").await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_sorted_numerically() {
        let temp = TempDir::new().unwrap();
        let store = FsChunkStore::new(temp.path()).unwrap();
        for id in ["10", "2", "1"] {
            store.add_metadata(meta(id)).await.unwrap();
        }
        let ids: Vec<String> = store.list_metadata().await.unwrap().into_iter().map(|m| m.file_id).collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
        assert!(matches!(store.add_metadata(meta("2")).await, Err(StoreError::DuplicateFile(_))));
    }

    #[tokio::test]
    async fn test_invalid_file_id() {
        let temp = TempDir::new().unwrap();
        let store = FsChunkStore::new(temp.path()).unwrap();
        assert!(store.get_chunks_for_file("../x").await.is_err());
    }
}
