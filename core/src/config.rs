//! # Wire Constants & Merchant Key Material
//!
//! Every magic string the PSP insists on lives here. The PSP compares these
//! byte for byte, so "close enough" is a 401.
//!
//! [`MerchantConfig`] is the only holder of key material in the process. It is
//! built once at startup, wrapped in an `Arc`, and never mutated again.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::keys::{load_private_key, load_public_key, KeyError};

// ---------------------------------------------------------------------------
// PSP Endpoints
// ---------------------------------------------------------------------------

/// Production host of the PSP merchant API.
pub const PSP_BASE_URL: &str = "https://api.mch.weixin.qq.com";

/// Canonical path of the merchant-to-user transfer endpoint. This exact
/// string goes into the signing payload, so no trailing slash, ever.
pub const TRANSFER_BILLS_PATH: &str = "/v3/fund-app/mch-transfer/transfer-bills";

// ---------------------------------------------------------------------------
// Envelope Format
// ---------------------------------------------------------------------------

/// Scheme token that prefixes the `Authorization` header value.
pub const AUTH_SCHEME: &str = "WECHATPAY2-SHA256-RSA2048";

/// Response/callback header carrying the PSP's Unix-second timestamp.
pub const HEADER_TIMESTAMP: &str = "Wechatpay-Timestamp";

/// Response/callback header carrying the PSP's nonce.
pub const HEADER_NONCE: &str = "Wechatpay-Nonce";

/// Response/callback header carrying the base64 RSA signature.
pub const HEADER_SIGNATURE: &str = "Wechatpay-Signature";

/// Serial (key id) of the PSP key that signed the message. Also sent on
/// outbound requests to tell the PSP which of its keys we trust.
pub const HEADER_SERIAL: &str = "Wechatpay-Serial";

/// PSP request identifier. Diagnostics only; never part of a signature.
pub const HEADER_REQUEST_ID: &str = "Request-Id";

/// Length of the outbound request nonce.
pub const NONCE_LENGTH: usize = 32;

/// Alphabet the outbound nonce is sampled from.
pub const NONCE_ALPHABET: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Largest tolerated distance between our clock and a PSP timestamp, in
/// either direction.
pub const MAX_TIMESTAMP_SKEW: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Callback Encryption
// ---------------------------------------------------------------------------

/// Algorithm label the PSP puts in `resource.algorithm`.
pub const CALLBACK_ALGORITHM: &str = "AEAD_AES_256_GCM";

/// AES-256-GCM key length (the merchant's API v3 key) in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. The PSP sends 12 ASCII characters.
pub const AES_NONCE_LENGTH: usize = 12;

// ---------------------------------------------------------------------------
// Transfer Defaults
// ---------------------------------------------------------------------------

/// Prefix of merchant-assigned bill numbers.
pub const OUT_BILL_NO_PREFIX: &str = "Transfer_";

/// Prefix of merchant-derived package tokens.
pub const PACKAGE_INFO_PREFIX: &str = "PK";

/// Transfer scene "cash marketing".
pub const DEFAULT_TRANSFER_SCENE_ID: &str = "1000";

/// What the user sees as the reason for the incoming money.
pub const DEFAULT_USER_RECV_PERCEPTION: &str = "现金奖励";

/// Scene report entries the PSP requires for scene 1000.
pub const DEFAULT_SCENE_REPORT_INFOS: [(&str, &str); 2] =
    [("活动名称", "新会员有礼"), ("奖励说明", "注册会员抽奖一等奖")];

/// Deadline applied to every store and PSP call made by the coordinator.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the diagnostic `PROCESSING → TRANSFERING` tick.
pub const PROGRESS_TICK_DELAY: Duration = Duration::from_secs(10);

/// How many times a transition is re-attempted after losing a race.
pub const MAX_TRANSITION_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// MerchantConfig
// ---------------------------------------------------------------------------

/// Immutable merchant identity and key material.
///
/// Holds the merchant's RSA private key (for signing requests), the PSP's
/// RSA public key (for verifying responses and callbacks) and the API v3
/// key (for decrypting callback resources). Share it as `Arc<MerchantConfig>`.
#[derive(Clone)]
pub struct MerchantConfig {
    mch_id: String,
    cert_serial: String,
    private_key: RsaPrivateKey,
    pay_public_key_id: String,
    pay_public_key: RsaPublicKey,
    api_v3_key: Vec<u8>,
}

impl MerchantConfig {
    /// Assemble a config from already-parsed keys.
    pub fn new(
        mch_id: impl Into<String>,
        cert_serial: impl Into<String>,
        private_key: RsaPrivateKey,
        pay_public_key_id: impl Into<String>,
        pay_public_key: RsaPublicKey,
        api_v3_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            mch_id: mch_id.into(),
            cert_serial: cert_serial.into(),
            private_key,
            pay_public_key_id: pay_public_key_id.into(),
            pay_public_key,
            api_v3_key: api_v3_key.into(),
        }
    }

    /// Load both PEM keys from disk and build the config.
    ///
    /// Unlike the fallback some SDK samples ship with, a key that fails to
    /// load is an error. Signing with a zero key just moves the failure to
    /// the first request.
    pub fn load(
        mch_id: &str,
        cert_serial: &str,
        private_key_path: impl AsRef<Path>,
        pay_public_key_id: &str,
        pay_public_key_path: impl AsRef<Path>,
        api_v3_key: &str,
    ) -> Result<Self, KeyError> {
        let private_key = load_private_key(private_key_path.as_ref())?;
        let pay_public_key = load_public_key(pay_public_key_path.as_ref())?;
        Ok(Self::new(
            mch_id,
            cert_serial,
            private_key,
            pay_public_key_id,
            pay_public_key,
            api_v3_key.as_bytes(),
        ))
    }

    /// Merchant id at the PSP.
    pub fn mch_id(&self) -> &str {
        &self.mch_id
    }

    /// Serial number of the merchant API certificate.
    pub fn cert_serial(&self) -> &str {
        &self.cert_serial
    }

    /// The merchant's signing key.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Key id of the PSP public key we trust.
    pub fn pay_public_key_id(&self) -> &str {
        &self.pay_public_key_id
    }

    /// The PSP public key.
    pub fn pay_public_key(&self) -> &RsaPublicKey {
        &self.pay_public_key
    }

    /// Symmetric key for callback decryption.
    pub fn api_v3_key(&self) -> &[u8] {
        &self.api_v3_key
    }
}

impl fmt::Debug for MerchantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerchantConfig")
            .field("mch_id", &self.mch_id)
            .field("cert_serial", &self.cert_serial)
            .field("pay_public_key_id", &self.pay_public_key_id)
            .field("private_key", &"<redacted>")
            .field("api_v3_key", &"<redacted>")
            .finish()
    }
}
