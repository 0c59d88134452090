//! Integrity codec for backup payloads
//!
//! Provides SHA-256 checksums, gzip compression and AES-256-GCM authenticated
//! encryption. The codec is stateless and injectable through the
//! [`IntegrityCodec`] trait so alternative algorithms can be swapped without
//! touching orchestration logic.
//!
//! Encrypted payload layout:
//!
//! ```text
//! +---------+-----------------+------------------------------+
//! | version |  nonce (12 B)   |  ciphertext + GCM tag (16 B) |
//! +---------+-----------------+------------------------------+
//! ```

use std::fmt;
use std::io::{Read, Write};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, Params};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ErrorKind;

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Current encrypted payload format version
const FORMAT_VERSION: u8 = 1;

/// Errors raised by the integrity codec
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    DecompressionError(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Ciphertext was tampered with, truncated, or the key is wrong
    #[error("Authentication failed: invalid key or corrupted data")]
    AuthenticationFailed,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

impl CodecError {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::DecompressionError(_) => ErrorKind::DecompressionError,
            CodecError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            CodecError::InvalidKey(_) => ErrorKind::Configuration,
            CodecError::Compression(_) | CodecError::Encryption(_) => ErrorKind::Internal,
        }
    }
}

/// A 256-bit encryption key, zeroed when dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Parse a key from base64 or hex text
    pub fn parse(encoded: &str) -> Result<Self, CodecError> {
        let encoded = encoded.trim();
        let mut bytes = if encoded.len() == 64 && encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            decode_hex(encoded)?
        } else {
            STANDARD
                .decode(encoded)
                .map_err(|e| CodecError::InvalidKey(format!("Invalid base64 key: {}", e)))?
        };

        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CodecError::InvalidKey(format!(
                "Expected 32 key bytes, got {}",
                len
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }

    /// Derive a key from a passphrase with Argon2id
    ///
    /// The salt must be at least 8 bytes and must be stored alongside the
    /// configuration so the same key can be derived again for restores.
    pub fn derive(passphrase: &str, salt: &[u8]) -> Result<Self, CodecError> {
        let params = Params::new(19 * 1024, 2, 1, Some(32))
            .map_err(|e| CodecError::InvalidKey(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CodecError::InvalidKey(format!("Key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([redacted])")
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, CodecError> {
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| CodecError::InvalidKey(format!("Invalid hex key: {}", e)))
        })
        .collect()
}

/// Checksum, compression and encryption of backup payloads
pub trait IntegrityCodec: Send + Sync {
    /// Compress a payload
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverse [`IntegrityCodec::compress`]
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Encrypt a payload with authenticated encryption
    fn encrypt(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CodecError>;

    /// Reverse [`IntegrityCodec::encrypt`]; must reject on any tag mismatch
    fn decrypt(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CodecError>;

    /// Hex digest of a payload
    fn checksum(&self, data: &[u8]) -> String;
}

/// gzip + AES-256-GCM + SHA-256
#[derive(Debug, Clone, Default)]
pub struct StandardCodec;

const GZIP_LEVEL: u32 = 6;

impl StandardCodec {
    pub fn new() -> Self {
        Self
    }
}

impl IntegrityCodec for StandardCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(format!("Failed to compress data: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(format!("Failed to finalize compression: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CodecError::DecompressionError(e.to_string()))?;
        Ok(decompressed)
    }

    fn encrypt(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CodecError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CodecError::Encryption(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|e| CodecError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CodecError> {
        // Anything malformed is reported as an authentication failure.
        if data.len() < 1 + NONCE_SIZE + TAG_SIZE || data[0] != FORMAT_VERSION {
            return Err(CodecError::AuthenticationFailed);
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CodecError::Encryption(format!("Failed to create cipher: {}", e)))?;

        let (nonce_bytes, ciphertext) = data[1..].split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CodecError::AuthenticationFailed)
    }

    fn checksum(&self, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }
}
