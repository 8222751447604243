//! dbase core: content-addressed chunk pipeline
//!
//! Turns a file into compressed, optionally encrypted chunks, each addressed
//! by a CIDv1 over its final bytes, and back again.
//!
//! # Example
//!
//! ```rust
//! use dbase_core::{codec, crypto};
//!
//! let key = crypto::derive_key_from_password("correct horse");
//! let data = vec![7u8; 300 * 1024];
//!
//! let chunks = codec::encode(&data[..], Some(&key), dbase_core::DEFAULT_CHUNK_SIZE)
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(chunks.len(), 3);
//!
//! let restored = codec::decode(chunks.iter().map(|c| (c.chunk_index, &c.payload)), Some(&key)).unwrap();
//! assert_eq!(restored, data);
//! ```

pub mod cid;
pub mod codec;
pub mod crypto;
pub mod filename;
pub mod store;
pub mod types;

pub use cid::{chunk_cid, parse_chunk_cid, verify_chunk_cid, CidError};
pub use codec::{decode, decode_chunks, encode, sort_by_index, ChunkEncoder, CodecError, EncodedChunk};
pub use crypto::{
    derive_key_from_password, derive_key_from_signature, generate_key, key_from_hex, key_to_hex,
    CryptoError, EncryptionKey,
};
pub use filename::{decode_file_name, encode_file_name};
pub use store::{next_file_id, ChunkStore, MemoryChunkStore, StoreError};
pub use types::{
    Chunk, ChunkMeta, ChunkSidecar, EncryptedChunk, EncryptionMethod, FileMetadata, KvRecord,
    DEFAULT_CHUNK_SIZE,
};
