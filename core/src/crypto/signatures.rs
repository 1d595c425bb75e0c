//! # RSA Signatures & Nonces
//!
//! SHA256-with-RSA (PKCS#1 v1.5) signing and verification, plus the nonce
//! generator used by outbound requests.
//!
//! PKCS#1 v1.5 signatures are deterministic: the same key and message always
//! produce the same bytes. That is what lets the PSP and us agree on a
//! signature without agreeing on anything else.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::config::{NONCE_ALPHABET, NONCE_LENGTH};

/// Errors while building or checking a signed envelope.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// No key to sign with, or the system RNG is unusable.
    #[error("crypto unavailable: {0}")]
    CryptoUnavailable(String),

    /// The PSP timestamp is further than the tolerated skew from our clock.
    #[error("expired timestamp: {timestamp} is more than {max_skew_secs}s from now ({now})")]
    ExpiredTimestamp {
        timestamp: i64,
        now: i64,
        max_skew_secs: u64,
    },

    /// The timestamp header is not a base-10 integer.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// The message was signed by a key we were not told to trust.
    #[error("serial-no mismatch: got {got}, expected {expected}")]
    SerialMismatch { expected: String, got: String },

    /// The signature does not verify (or is not even base64).
    #[error("invalid signature")]
    SignatureInvalid,

    /// A mandatory envelope header is absent or not valid UTF-8.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
}

/// Sign `message` with SHA256-with-RSA and return the base64 signature.
pub fn sign_sha256_rsa(
    private_key: &RsaPrivateKey,
    message: &[u8],
) -> Result<String, SignatureError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(|e| SignatureError::CryptoUnavailable(e.to_string()))?;
    Ok(STANDARD.encode(signature.to_bytes()))
}

/// Verify a base64 SHA256-with-RSA signature over `message`.
///
/// Malformed base64, a signature of the wrong length and a signature that
/// simply doesn't match all collapse into [`SignatureError::SignatureInvalid`].
pub fn verify_sha256_rsa(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), SignatureError> {
    let raw = STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| SignatureError::SignatureInvalid)?;
    let signature =
        Signature::try_from(raw.as_slice()).map_err(|_| SignatureError::SignatureInvalid)?;
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(message, &signature)
        .map_err(|_| SignatureError::SignatureInvalid)
}

/// Generate a [`NONCE_LENGTH`]-character nonce from `[0-9A-Za-z]`.
///
/// Bytes are drawn from the OS CSPRNG and rejection-sampled so that every
/// symbol is equally likely: 62 does not divide 256, so bytes at or above
/// 248 (the largest multiple of 62) are discarded instead of folded.
pub fn generate_nonce() -> Result<String, SignatureError> {
    const ACCEPT_BELOW: u8 = (256 / NONCE_ALPHABET.len() * NONCE_ALPHABET.len()) as u8;

    let mut out = String::with_capacity(NONCE_LENGTH);
    let mut buf = [0u8; NONCE_LENGTH * 2];
    while out.len() < NONCE_LENGTH {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| SignatureError::CryptoUnavailable(format!("random source: {e}")))?;
        for &b in buf.iter().filter(|&&b| b < ACCEPT_BELOW) {
            if out.len() == NONCE_LENGTH {
                break;
            }
            out.push(NONCE_ALPHABET[(b as usize) % NONCE_ALPHABET.len()] as char);
        }
    }
    Ok(out)
}
