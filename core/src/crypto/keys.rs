//! # RSA Key Loading
//!
//! The PSP hands out keys as PEM files: the merchant's PKCS#8 private key
//! and the PSP's own PKIX (SubjectPublicKeyInfo) public key. Both must be
//! RSA. An EC key with the right PEM label is still the wrong key.

use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// PEM label of a PKCS#8 private key.
pub const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

/// PEM label of a PKIX public key.
pub const PUBLIC_KEY_LABEL: &str = "PUBLIC KEY";

/// Errors while reading or parsing key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key parse error: {0}")]
    Parse(String),
}

/// Which half of a key pair is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// PKCS#8, labelled `PRIVATE KEY`.
    Private,
    /// PKIX, labelled `PUBLIC KEY`.
    Public,
}

impl KeyKind {
    fn label(self) -> &'static str {
        match self {
            KeyKind::Private => PRIVATE_KEY_LABEL,
            KeyKind::Public => PUBLIC_KEY_LABEL,
        }
    }
}

/// A parsed RSA key of either kind.
#[derive(Debug, Clone)]
pub enum LoadedKey {
    Private(RsaPrivateKey),
    Public(RsaPublicKey),
}

/// Load a key from either inline PEM text or a path to a PEM file.
///
/// Input containing a `-----BEGIN` marker is treated as PEM; anything else
/// is treated as a filesystem path.
pub fn load_key(path_or_pem: &str, kind: KeyKind) -> Result<LoadedKey, KeyError> {
    let pem = if path_or_pem.contains("-----BEGIN") {
        path_or_pem.to_string()
    } else {
        read_pem(Path::new(path_or_pem))?
    };

    match kind {
        KeyKind::Private => parse_private_key_pem(&pem).map(LoadedKey::Private),
        KeyKind::Public => parse_public_key_pem(&pem).map(LoadedKey::Public),
    }
}

/// Read and parse the merchant's PKCS#8 private key from disk.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    parse_private_key_pem(&read_pem(path)?)
}

/// Read and parse the PSP's PKIX public key from disk.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyError> {
    parse_public_key_pem(&read_pem(path)?)
}

/// Parse a PKCS#8 RSA private key from PEM text.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    expect_label(pem, KeyKind::Private)?;
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| KeyError::Parse(format!("not a PKCS#8 RSA private key: {e}")))
}

/// Parse a PKIX RSA public key from PEM text.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    expect_label(pem, KeyKind::Public)?;
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| KeyError::Parse(format!("not a PKIX RSA public key: {e}")))
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Returns the label of the first PEM block, e.g. `PRIVATE KEY`.
fn pem_label(pem: &str) -> Option<&str> {
    let start = pem.find("-----BEGIN ")? + "-----BEGIN ".len();
    let rest = &pem[start..];
    let end = rest.find("-----")?;
    Some(&rest[..end])
}

fn expect_label(pem: &str, kind: KeyKind) -> Result<(), KeyError> {
    match pem_label(pem) {
        Some(label) if label == kind.label() => Ok(()),
        Some(label) => Err(KeyError::Parse(format!(
            "the kind of PEM should be {}, found {label}",
            kind.label()
        ))),
        None => Err(KeyError::Parse("no PEM block found".to_string())),
    }
}
