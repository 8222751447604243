//! Content identifiers for chunk payloads
//!
//! A chunk CID is a CIDv1 with the `raw` multicodec over a sha2-256 multihash,
//! rendered in multibase base32 (lowercase, unpadded, `b` prefix):
//!
//! ```text
//! b + base32( 0x01 | 0x55 | 0x12 | 0x20 | sha256(ciphertext) )
//! ```
//!
//! The digest is always taken over the final payload bytes (ciphertext when
//! encrypted), never over plaintext.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// CID version 1
const CID_VERSION: u8 = 0x01;
/// Multicodec `raw`
const CODEC_RAW: u8 = 0x55;
/// Multihash `sha2-256`
const MULTIHASH_SHA2_256: u8 = 0x12;
/// sha2-256 digest length
const DIGEST_LEN: u8 = 0x20;
/// Multibase prefix for lowercase base32
const MULTIBASE_BASE32: char = 'b';

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidError {
    #[error("Unsupported multibase prefix: {0:?}")]
    UnsupportedMultibase(Option<char>),
    #[error("Invalid base32 character: {0:?}")]
    InvalidBase32(char),
    #[error("Unsupported CID header: version={version:#x} codec={codec:#x}")]
    UnsupportedHeader { version: u8, codec: u8 },
    #[error("Unsupported multihash: code={code:#x} len={len}")]
    UnsupportedMultihash { code: u8, len: u8 },
    #[error("Invalid CID length: {0} bytes")]
    InvalidLength(usize),
}

/// Compute the CID string for a chunk payload
pub fn chunk_cid(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);

    let mut bytes = Vec::with_capacity(4 + digest.len());
    bytes.extend_from_slice(&[CID_VERSION, CODEC_RAW, MULTIHASH_SHA2_256, DIGEST_LEN]);
    bytes.extend_from_slice(&digest);

    let mut out = String::with_capacity(1 + (bytes.len() * 8).div_ceil(5));
    out.push(MULTIBASE_BASE32);
    out.push_str(&base32_encode(&bytes));
    out
}

/// Parse a chunk CID and return its sha256 digest
pub fn parse_chunk_cid(cid: &str) -> Result<[u8; 32], CidError> {
    let mut chars = cid.chars();
    match chars.next() {
        Some(MULTIBASE_BASE32) => {}
        other => return Err(CidError::UnsupportedMultibase(other)),
    }

    let bytes = base32_decode(chars.as_str())?;
    if bytes.len() != 36 {
        return Err(CidError::InvalidLength(bytes.len()));
    }
    if bytes[0] != CID_VERSION || bytes[1] != CODEC_RAW {
        return Err(CidError::UnsupportedHeader {
            version: bytes[0],
            codec: bytes[1],
        });
    }
    if bytes[2] != MULTIHASH_SHA2_256 || bytes[3] != DIGEST_LEN {
        return Err(CidError::UnsupportedMultihash {
            code: bytes[2],
            len: bytes[3],
        });
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes[4..]);
    Ok(digest)
}

/// Check that `payload` hashes to `cid`
pub fn verify_chunk_cid(cid: &str, payload: &[u8]) -> Result<bool, CidError> {
    let digest = parse_chunk_cid(cid)?;
    Ok(digest[..] == Sha256::digest(payload)[..])
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Result<Vec<u8>, CidError> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in s.chars() {
        let value = match c {
            'a'..='z' => c as u32 - 'a' as u32,
            '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return Err(CidError::InvalidBase32(c)),
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector_empty_payload() {
        // sha256("") = e3b0c442...; CIDv1 raw of the empty string
        assert_eq!(
            chunk_cid(b""),
            "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku"
        );
    }

    #[test]
    fn test_raw_cid_prefix() {
        assert!(chunk_cid(b"hello").starts_with("bafkrei"));
    }

    #[test]
    fn test_deterministic_and_distinct() {
        assert_eq!(chunk_cid(b"abc"), chunk_cid(b"abc"));
        assert_ne!(chunk_cid(b"abc"), chunk_cid(b"abd"));
    }

    #[test]
    fn test_parse_and_verify() {
        let cid = chunk_cid(b"payload");
        assert!(verify_chunk_cid(&cid, b"payload").unwrap());
        assert!(!verify_chunk_cid(&cid, b"other").unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_chunk_cid("zabc"),
            Err(CidError::UnsupportedMultibase(Some('z')))
        );
        assert_eq!(parse_chunk_cid(""), Err(CidError::UnsupportedMultibase(None)));
        assert_eq!(parse_chunk_cid("bafk!"), Err(CidError::InvalidBase32('!')));
        assert!(matches!(parse_chunk_cid("bafkrei"), Err(CidError::InvalidLength(_))));
    }

    #[test]
    fn test_base32_roundtrip() {
        let data: Vec<u8> = (0u8..=40).collect();
        assert_eq!(base32_decode(&base32_encode(&data)).unwrap(), data);
    }
}
