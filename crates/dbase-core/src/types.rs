//! Record shapes shared by the codec, the stores and the transfer protocol
//!
//! Field names follow the JSON wire shape (`camelCase`, `chunkCID`), so the
//! same structs serialize into chunk files, metadata files and transfer frames.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference slice size for the chunk codec (128 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// How a chunk payload was protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EncryptionMethod {
    /// Compressed bytes stored as-is
    #[serde(rename = "None")]
    None,
    /// AES-256-GCM with a fresh 96-bit nonce per chunk
    #[default]
    #[serde(rename = "AES-GCM")]
    AesGcm,
}

impl EncryptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMethod::None => "None",
            EncryptionMethod::AesGcm => "AES-GCM",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, EncryptionMethod::AesGcm)
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" | "none" => Ok(EncryptionMethod::None),
            "AES-GCM" | "aes-gcm" | "AES" => Ok(EncryptionMethod::AesGcm),
            other => Err(format!("unknown encryption method: {}", other)),
        }
    }
}

/// Compress-then-encrypt output for one slice.
///
/// `iv` is absent when the chunk is not encrypted. Bytes serialize as JSON
/// integer arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

impl EncryptedChunk {
    pub fn plain(data: Vec<u8>) -> Self {
        Self { iv: None, data }
    }

    pub fn sealed(iv: Vec<u8>, data: Vec<u8>) -> Self {
        Self { iv: Some(iv), data }
    }
}

/// A chunk as held by the chunk store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub owner: String,
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: u32,
    #[serde(rename = "chunkCID")]
    pub chunk_cid: String,
    #[serde(rename = "chunk")]
    pub payload: EncryptedChunk,
    pub encryption_method: EncryptionMethod,
}

impl Chunk {
    /// The replication form of this chunk
    pub fn to_meta(&self) -> ChunkMeta {
        ChunkMeta {
            owner: self.owner.clone(),
            file_name: self.file_name.clone(),
            chunk_cid: self.chunk_cid.clone(),
            chunk_index: self.chunk_index,
            encrypted_chunk: self.payload.clone(),
            encryption_method: self.encryption_method,
        }
    }
}

/// Per-file record, written once after every chunk of an upload is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub owner: String,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub num_chunks: u32,
    pub encryption_method: EncryptionMethod,
}

/// Chunk record as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub owner: String,
    pub file_name: String,
    #[serde(rename = "chunkCID")]
    pub chunk_cid: String,
    pub chunk_index: u32,
    pub encrypted_chunk: EncryptedChunk,
    pub encryption_method: EncryptionMethod,
}

impl ChunkMeta {
    /// Sidecar metadata written next to a received chunk
    pub fn sidecar(&self) -> ChunkSidecar {
        ChunkSidecar {
            owner: self.owner.clone(),
            file_name: self.file_name.clone(),
            chunk_cid: self.chunk_cid.clone(),
            chunk_index: self.chunk_index,
            encryption_method: self.encryption_method,
        }
    }
}

/// Contents of `<chunkCID>_meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSidecar {
    pub owner: String,
    pub file_name: String,
    #[serde(rename = "chunkCID")]
    pub chunk_cid: String,
    pub chunk_index: u32,
    pub encryption_method: EncryptionMethod,
}

/// `{key: chunkCID, value: chunkMeta}`, the unit of a transfer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    pub key: String,
    pub value: ChunkMeta,
}

impl KvRecord {
    pub fn new(meta: ChunkMeta) -> Self {
        Self {
            key: meta.chunk_cid.clone(),
            value: meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ChunkMeta {
        ChunkMeta {
            owner: "node-1".to_string(),
            file_name: "a.txt".to_string(),
            chunk_cid: "bafkreiabc".to_string(),
            chunk_index: 2,
            encrypted_chunk: EncryptedChunk::sealed(vec![1; 12], vec![9, 8, 7]),
            encryption_method: EncryptionMethod::AesGcm,
        }
    }

    #[test]
    fn test_chunk_meta_wire_names() {
        let json = serde_json::to_string(&sample_meta()).unwrap();
        assert!(json.contains("\"chunkCID\":\"bafkreiabc\""));
        assert!(json.contains("\"fileName\":\"a.txt\""));
        assert!(json.contains("\"chunkIndex\":2"));
        assert!(json.contains("\"encryptionMethod\":\"AES-GCM\""));
        assert!(json.contains("\"data\":[9,8,7]"));
    }

    #[test]
    fn test_unencrypted_chunk_has_no_iv() {
        let json = serde_json::to_string(&EncryptedChunk::plain(vec![1, 2])).unwrap();
        assert_eq!(json, r#"{"data":[1,2]}"#);

        let parsed: EncryptedChunk = serde_json::from_str(r#"{"data":[5]}"#).unwrap();
        assert_eq!(parsed.iv, None);
    }

    #[test]
    fn test_kv_record_key_is_cid() {
        let record = KvRecord::new(sample_meta());
        assert_eq!(record.key, "bafkreiabc");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with("{\"key\":\"bafkreiabc\",\"value\":{"));
    }

    #[test]
    fn test_encryption_method_parse() {
        assert_eq!("None".parse::<EncryptionMethod>().unwrap(), EncryptionMethod::None);
        assert_eq!("AES-GCM".parse::<EncryptionMethod>().unwrap(), EncryptionMethod::AesGcm);
        assert!("rot13".parse::<EncryptionMethod>().is_err());
    }
}
