//! # CryptoEnvelope
//!
//! The PSP's identity check, in both directions, and the only defense
//! against forged callbacks:
//!
//! - **RSA-2048 / SHA-256 (PKCS#1 v1.5)** signs our requests and verifies
//!   the PSP's responses and callbacks.
//! - **AES-256-GCM** opens the encrypted resource inside a callback.
//!
//! Everything here is a thin wrapper over RustCrypto crates. The hard part is
//! not the math, it's getting every newline in the right place.

pub mod encryption;
pub mod envelope;
pub mod keys;
pub mod signatures;

pub use encryption::{decrypt_callback_resource, encrypt_callback_resource, EncryptionError};
pub use envelope::{build_authorization, verify_response, Authorization};
pub use keys::{load_key, KeyError, KeyKind, LoadedKey};
pub use signatures::{generate_nonce, SignatureError};
