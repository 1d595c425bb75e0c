//! # Callback Resource Decryption
//!
//! The interesting part of a PSP callback (which bill, which state) arrives
//! inside `resource.ciphertext`, sealed with AES-256-GCM under the merchant's
//! API v3 key. The nonce and associated data travel next to it in clear.
//!
//! ## Wire format
//!
//! - `ciphertext` is standard base64 of `encrypted_bytes || 16-byte tag`.
//! - `nonce` is a 12-character string; its UTF-8 bytes are the GCM nonce.
//! - `associated_data` is authenticated but not encrypted.
//!
//! A tag mismatch means the key is wrong or the payload was modified. We do
//! not try to tell those apart.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Errors that can occur while opening or sealing a callback resource.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("invalid key length: expected {AES_KEY_LENGTH} bytes, got {0}")]
    KeyLengthInvalid(usize),

    #[error("invalid nonce length: expected {AES_NONCE_LENGTH} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("ciphertext is not valid base64")]
    InvalidCiphertext,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Decrypt `resource.ciphertext` of a PSP callback.
///
/// # Errors
///
/// - [`EncryptionError::KeyLengthInvalid`] unless `key` is exactly 32 bytes.
/// - [`EncryptionError::InvalidNonceLength`] unless `nonce` is 12 bytes.
/// - [`EncryptionError::InvalidCiphertext`] if the base64 is malformed.
/// - [`EncryptionError::DecryptionFailed`] on tag mismatch.
pub fn decrypt_callback_resource(
    key: &[u8],
    associated_data: &str,
    nonce: &str,
    ciphertext_b64: &str,
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = cipher_for(key)?;
    let nonce = nonce_for(nonce)?;
    let ciphertext = STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| EncryptionError::InvalidCiphertext)?;

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: associated_data.as_bytes(),
            },
        )
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Seal `plaintext` into the callback resource format. The inverse of
/// [`decrypt_callback_resource`]; the PSP side of the exchange.
pub fn encrypt_callback_resource(
    key: &[u8],
    associated_data: &str,
    nonce: &str,
    plaintext: &[u8],
) -> Result<String, EncryptionError> {
    let cipher = cipher_for(key)?;
    let nonce = nonce_for(nonce)?;
    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data.as_bytes(),
            },
        )
        .map_err(|_| EncryptionError::EncryptionFailed)?;
    Ok(STANDARD.encode(sealed))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, EncryptionError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(EncryptionError::KeyLengthInvalid(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::KeyLengthInvalid(key.len()))
}

// `Nonce::from_slice` panics on a wrong length, so check first.
fn nonce_for(nonce: &str) -> Result<&Nonce<aes_gcm::aead::consts::U12>, EncryptionError> {
    let bytes = nonce.as_bytes();
    if bytes.len() != AES_NONCE_LENGTH {
        return Err(EncryptionError::InvalidNonceLength(bytes.len()));
    }
    Ok(Nonce::from_slice(bytes))
}
