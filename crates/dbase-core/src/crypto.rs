//! Chunk encryption and key derivation
//!
//! AES-256-GCM with a random 96-bit nonce per call. The nonce travels next to
//! the ciphertext (`EncryptedChunk::iv`), not prefixed to it, so the content
//! address is computed over the ciphertext alone.
//!
//! Keys come from one of:
//! - PBKDF2-HMAC-SHA256 over a password (fixed salt)
//! - PBKDF2-HMAC-SHA256 over a wallet signature, salted with the wallet address
//! - `generate_key()` for random keys exchanged as hex

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

/// 32-byte AES key
pub type EncryptionKey = [u8; 32];

/// Nonce size for AES-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Auth tag size for AES-GCM
const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt used for password-derived keys
const PASSWORD_SALT: &[u8] = b"some-salt";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Encrypted data too short")]
    DataTooShort,
    #[error("Invalid nonce length: {0}")]
    InvalidNonce(usize),
    #[error("Invalid key length")]
    InvalidKeyLength,
}

/// Generate a random 32-byte key
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Derive a key from a user password
pub fn derive_key_from_password(password: &str) -> EncryptionKey {
    pbkdf2_key(password.as_bytes(), PASSWORD_SALT)
}

/// Derive a key from a wallet signature, salted with the wallet address
pub fn derive_key_from_signature(signature: &str, wallet_address: &str) -> EncryptionKey {
    pbkdf2_key(signature.as_bytes(), wallet_address.as_bytes())
}

fn pbkdf2_key(secret: &[u8], salt: &[u8]) -> EncryptionKey {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt with a fresh random nonce.
///
/// Returns `(nonce, ciphertext || tag)`.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt `ciphertext || tag`. Fails closed on tag mismatch.
pub fn decrypt(nonce: &[u8], ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DataTooShort);
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Calculate ciphertext size for a given plaintext size
pub fn encrypted_size(plaintext_size: usize) -> usize {
    plaintext_size + TAG_SIZE
}

/// Convert key to hex string
pub fn key_to_hex(key: &EncryptionKey) -> String {
    hex::encode(key)
}

/// Convert hex string to key
pub fn key_from_hex(hex_str: &str) -> Result<EncryptionKey, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidKeyLength)?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
