//! Chunk codec: slice, compress, encrypt, address
//!
//! Encoding is lazy: [`ChunkEncoder`] pulls one slice at a time from any
//! `Read` source. Decoding is all-or-nothing: a single corrupt chunk fails the
//! whole file and no partial output is returned.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

use crate::cid::chunk_cid;
use crate::crypto::{self, CryptoError, EncryptionKey};
use crate::types::{Chunk, EncryptedChunk};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Corrupt chunk {index}: {reason}")]
    CorruptChunk { index: u32, reason: String },
    #[error("Chunks out of order: expected index {expected}, found {found}")]
    OutOfOrder { expected: u32, found: u32 },
    #[error("Chunk {0} is encrypted but no key was supplied")]
    MissingKey(u32),
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("Encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One encoded slice
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub chunk_index: u32,
    pub chunk_cid: String,
    pub payload: EncryptedChunk,
    /// Size of the slice before compression
    pub plain_len: usize,
}

/// Lazy encoder over a byte source
pub struct ChunkEncoder<R> {
    reader: R,
    key: Option<EncryptionKey>,
    chunk_size: usize,
    next_index: u32,
    done: bool,
}

/// Start encoding `reader` into chunks of `chunk_size` bytes.
///
/// An empty source still yields one (empty) chunk so that every stored file
/// has at least one chunk to decode.
pub fn encode<R: Read>(
    reader: R,
    key: Option<&EncryptionKey>,
    chunk_size: usize,
) -> Result<ChunkEncoder<R>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::InvalidChunkSize);
    }
    Ok(ChunkEncoder {
        reader,
        key: key.copied(),
        chunk_size,
        next_index: 0,
        done: false,
    })
}

impl<R: Read> ChunkEncoder<R> {
    fn read_slice(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for ChunkEncoder<R> {
    type Item = Result<EncodedChunk, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let slice = match self.read_slice() {
            Ok(slice) => slice,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        if slice.len() < self.chunk_size {
            self.done = true;
            if slice.is_empty() && self.next_index > 0 {
                return None;
            }
        }

        let index = self.next_index;
        self.next_index += 1;

        Some(encode_slice(&slice, self.key.as_ref()).map(|payload| EncodedChunk {
            chunk_index: index,
            chunk_cid: chunk_cid(&payload.data),
            payload,
            plain_len: slice.len(),
        }))
    }
}

/// Compress and (optionally) encrypt one slice
pub fn encode_slice(slice: &[u8], key: Option<&EncryptionKey>) -> Result<EncryptedChunk, CodecError> {
    let compressed = compress(slice)?;
    match key {
        Some(key) => {
            let (nonce, data) = crypto::encrypt(&compressed, key)?;
            Ok(EncryptedChunk::sealed(nonce.to_vec(), data))
        }
        None => Ok(EncryptedChunk::plain(compressed)),
    }
}

/// Decrypt (when sealed) and inflate one chunk payload
pub fn decode_chunk(
    index: u32,
    payload: &EncryptedChunk,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>, CodecError> {
    let compressed = match (&payload.iv, key) {
        (Some(iv), Some(key)) => {
            crypto::decrypt(iv, &payload.data, key).map_err(|e| CodecError::CorruptChunk {
                index,
                reason: e.to_string(),
            })?
        }
        (Some(_), None) => return Err(CodecError::MissingKey(index)),
        (None, _) => payload.data.clone(),
    };

    decompress(&compressed).map_err(|e| CodecError::CorruptChunk {
        index,
        reason: format!("inflate failed: {}", e),
    })
}

/// Decode chunks supplied in ascending index order.
///
/// Indices must run 0, 1, 2, ... without gaps. Callers holding an unordered
/// set sort by index first (see [`sort_by_index`]).
pub fn decode<'a, I>(chunks: I, key: Option<&EncryptionKey>) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = (u32, &'a EncryptedChunk)>,
{
    let mut out = Vec::new();
    for (expected, (index, payload)) in (0u32..).zip(chunks) {
        if index != expected {
            return Err(CodecError::OutOfOrder {
                expected,
                found: index,
            });
        }
        out.extend_from_slice(&decode_chunk(index, payload, key)?);
    }
    Ok(out)
}

/// Decode store chunks (must already be sorted)
pub fn decode_chunks(chunks: &[Chunk], key: Option<&EncryptionKey>) -> Result<Vec<u8>, CodecError> {
    decode(chunks.iter().map(|c| (c.chunk_index, &c.payload)), key)
}

/// Sort chunks by index. Never by CID: hash order is not stream order.
pub fn sort_by_index(chunks: &mut [Chunk]) {
    chunks.sort_by_key(|c| c.chunk_index);
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn encode_all(data: &[u8], key: Option<&EncryptionKey>, size: usize) -> Vec<EncodedChunk> {
        encode(data, key, size)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn decode_all(chunks: &[EncodedChunk], key: Option<&EncryptionKey>) -> Result<Vec<u8>, CodecError> {
        decode(chunks.iter().map(|c| (c.chunk_index, &c.payload)), key)
    }

    #[test]
    fn test_roundtrip_with_key() {
        let key = generate_key();
        let data = sample(10_000);
        let chunks = encode_all(&data, Some(&key), 4096);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.payload.iv.is_some()));
        assert_eq!(decode_all(&chunks, Some(&key)).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_without_key() {
        let data = sample(5000);
        let chunks = encode_all(&data, None, 1024);
        assert!(chunks.iter().all(|c| c.payload.iv.is_none()));
        assert_eq!(decode_all(&chunks, None).unwrap(), data);
    }

    #[test]
    fn test_slice_sizes_300k() {
        let data = sample(300 * 1024);
        let chunks = encode_all(&data, Some(&generate_key()), 128 * 1024);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.plain_len).collect();
        assert_eq!(sizes, vec![128 * 1024, 128 * 1024, 44 * 1024]);

        let mut cids: Vec<&str> = chunks.iter().map(|c| c.chunk_cid.as_str()).collect();
        cids.sort();
        cids.dedup();
        assert_eq!(cids.len(), 3);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let chunks = encode_all(&sample(2048), None, 1024);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_empty_input_yields_one_chunk() {
        let chunks = encode_all(b"", None, 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(decode_all(&chunks, None).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_cid_over_ciphertext() {
        let chunks = encode_all(b"same plaintext", Some(&generate_key()), 1024);
        let again = encode_all(b"same plaintext", Some(&generate_key()), 1024);
        // fresh nonce, fresh key: different ciphertext, different address
        assert_ne!(chunks[0].chunk_cid, again[0].chunk_cid);
        assert_eq!(chunks[0].chunk_cid, chunk_cid(&chunks[0].payload.data));
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let chunks = encode_all(&sample(100), Some(&generate_key()), 64);
        let err = decode_all(&chunks, Some(&generate_key())).unwrap_err();
        assert!(matches!(err, CodecError::CorruptChunk { index: 0, .. }));
    }

    #[test]
    fn test_bad_deflate_is_corrupt() {
        let bogus = EncryptedChunk::plain(vec![1, 2, 3, 4]);
        let err = decode([(0, &bogus)], None).unwrap_err();
        assert!(matches!(err, CodecError::CorruptChunk { index: 0, .. }));
    }

    #[test]
    fn test_missing_key() {
        let chunks = encode_all(b"x", Some(&generate_key()), 64);
        assert!(matches!(decode_all(&chunks, None), Err(CodecError::MissingKey(0))));
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let data = sample(300);
        let mut chunks = encode_all(&data, None, 100);
        chunks.swap(0, 2);
        assert!(matches!(
            decode_all(&chunks, None),
            Err(CodecError::OutOfOrder { expected: 0, found: 2 })
        ));

        chunks.sort_by_key(|c| c.chunk_index);
        assert_eq!(decode_all(&chunks, None).unwrap(), data);
    }

    #[test]
    fn test_zero_chunk_size() {
        assert!(matches!(encode(&b"x"[..], None, 0), Err(CodecError::InvalidChunkSize)));
    }
}
