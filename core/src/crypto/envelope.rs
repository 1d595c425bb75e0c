//! # Signed Request / Verified Response Envelope
//!
//! Every request we send carries an `Authorization` header whose signature
//! covers the method, the canonical path, a timestamp, a nonce and the raw
//! body. Every response and callback the PSP sends carries the mirror image
//! in four `Wechatpay-*` headers.
//!
//! ## Payload formats
//!
//! ```text
//! request:  METHOD \n PATH \n TIMESTAMP \n NONCE \n BODY \n
//! response: TIMESTAMP \n NONCE \n BODY \n
//! ```
//!
//! The trailing newline after the body is mandatory, even when the body is
//! empty. The body is embedded as raw bytes; re-serializing JSON between
//! signing and sending produces a different payload and a 401.

use std::fmt;
use std::str::FromStr;

use http::HeaderMap;
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::signatures::{generate_nonce, sign_sha256_rsa, verify_sha256_rsa, SignatureError};
use crate::config::{
    AUTH_SCHEME, HEADER_NONCE, HEADER_REQUEST_ID, HEADER_SERIAL, HEADER_SIGNATURE,
    HEADER_TIMESTAMP, MAX_TIMESTAMP_SKEW,
};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Build the request signing payload `method\npath\ntimestamp\nnonce\nbody\n`.
pub fn signing_payload(
    method: &str,
    canonical_path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Vec<u8> {
    let head = format!("{method}\n{canonical_path}\n{timestamp}\n{nonce}\n");
    let mut payload = Vec::with_capacity(head.len() + body.len() + 1);
    payload.extend_from_slice(head.as_bytes());
    payload.extend_from_slice(body);
    payload.push(b'\n');
    payload
}

/// Build the response verification payload `timestamp\nnonce\nbody\n`.
///
/// The timestamp is taken verbatim from the header string, not re-rendered
/// from a parsed integer, so leading zeros survive.
pub fn verification_payload(timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let head = format!("{timestamp}\n{nonce}\n");
    let mut payload = Vec::with_capacity(head.len() + body.len() + 1);
    payload.extend_from_slice(head.as_bytes());
    payload.extend_from_slice(body);
    payload.push(b'\n');
    payload
}

// ---------------------------------------------------------------------------
// Authorization header
// ---------------------------------------------------------------------------

/// The parsed form of an outbound `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub mch_id: String,
    pub nonce: String,
    pub timestamp: i64,
    pub serial_no: String,
    pub signature: String,
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{AUTH_SCHEME} mchid=\"{}\",nonce_str=\"{}\",timestamp=\"{}\",serial_no=\"{}\",signature=\"{}\"",
            self.mch_id, self.nonce, self.timestamp, self.serial_no, self.signature
        )
    }
}

impl FromStr for Authorization {
    type Err = String;

    /// Parse a header value produced by [`Authorization`]'s `Display`. Used
    /// by PSP-side tooling and tests to check what we sent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params = s
            .strip_prefix(AUTH_SCHEME)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(|| format!("authorization must start with {AUTH_SCHEME}"))?;

        let mut mch_id = None;
        let mut nonce = None;
        let mut timestamp = None;
        let mut serial_no = None;
        let mut signature = None;

        for pair in params.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("malformed parameter: {pair}"))?;
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| format!("parameter {key} is not quoted"))?
                .to_string();
            match key {
                "mchid" => mch_id = Some(value),
                "nonce_str" => nonce = Some(value),
                "timestamp" => {
                    timestamp = Some(value.parse::<i64>().map_err(|e| e.to_string())?)
                }
                "serial_no" => serial_no = Some(value),
                "signature" => signature = Some(value),
                other => return Err(format!("unknown parameter: {other}")),
            }
        }

        Ok(Self {
            mch_id: mch_id.ok_or("missing mchid")?,
            nonce: nonce.ok_or("missing nonce_str")?,
            timestamp: timestamp.ok_or("missing timestamp")?,
            serial_no: serial_no.ok_or("missing serial_no")?,
            signature: signature.ok_or("missing signature")?,
        })
    }
}

/// Build the `Authorization` header value for an outbound request.
///
/// Draws a fresh nonce from the OS RNG and stamps the current Unix second.
/// Fails with [`SignatureError::CryptoUnavailable`] when there is no key or
/// no randomness.
pub fn build_authorization(
    mch_id: &str,
    cert_serial: &str,
    private_key: Option<&RsaPrivateKey>,
    http_method: &str,
    canonical_path: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let private_key = private_key
        .ok_or_else(|| SignatureError::CryptoUnavailable("merchant private key not loaded".into()))?;
    let nonce = generate_nonce()?;
    let timestamp = chrono::Utc::now().timestamp();
    let auth = sign_request_at(
        mch_id,
        cert_serial,
        private_key,
        http_method,
        canonical_path,
        body,
        timestamp,
        &nonce,
    )?;
    Ok(auth.to_string())
}

/// Deterministic core of [`build_authorization`] with caller-chosen
/// timestamp and nonce.
#[allow(clippy::too_many_arguments)]
pub fn sign_request_at(
    mch_id: &str,
    cert_serial: &str,
    private_key: &RsaPrivateKey,
    http_method: &str,
    canonical_path: &str,
    body: &[u8],
    timestamp: i64,
    nonce: &str,
) -> Result<Authorization, SignatureError> {
    let payload = signing_payload(http_method, canonical_path, timestamp, nonce, body);
    let signature = sign_sha256_rsa(private_key, &payload)?;
    Ok(Authorization {
        mch_id: mch_id.to_string(),
        nonce: nonce.to_string(),
        timestamp,
        serial_no: cert_serial.to_string(),
        signature,
    })
}

/// Sign a response or callback body the way the PSP does. Returns the
/// base64 signature for the `Wechatpay-Signature` header.
pub fn sign_response(
    private_key: &RsaPrivateKey,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    sign_sha256_rsa(private_key, &verification_payload(timestamp, nonce, body))
}

// ---------------------------------------------------------------------------
// Response verification
// ---------------------------------------------------------------------------

/// Verify the signature headers of a PSP response or callback.
///
/// Checks, in order: timestamp within [`MAX_TIMESTAMP_SKEW`] of now (either
/// direction), serial equal to `expected_key_id`, RSA signature over
/// `timestamp\nnonce\nbody\n`.
pub fn verify_response(
    expected_key_id: &str,
    public_key: &RsaPublicKey,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), SignatureError> {
    verify_response_at(
        chrono::Utc::now().timestamp(),
        expected_key_id,
        public_key,
        headers,
        body,
    )
}

/// [`verify_response`] against an explicit clock reading.
pub fn verify_response_at(
    now: i64,
    expected_key_id: &str,
    public_key: &RsaPublicKey,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), SignatureError> {
    let request_id = header_str(headers, HEADER_REQUEST_ID).unwrap_or("");
    let result = check_envelope(now, expected_key_id, public_key, headers, body);
    if let Err(e) = &result {
        tracing::warn!(request_id, error = %e, "PSP envelope rejected");
    }
    result
}

fn check_envelope(
    now: i64,
    expected_key_id: &str,
    public_key: &RsaPublicKey,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), SignatureError> {
    let timestamp_str =
        header_str(headers, HEADER_TIMESTAMP).ok_or(SignatureError::MissingHeader(HEADER_TIMESTAMP))?;
    let nonce = header_str(headers, HEADER_NONCE).ok_or(SignatureError::MissingHeader(HEADER_NONCE))?;
    let signature =
        header_str(headers, HEADER_SIGNATURE).ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;
    let serial =
        header_str(headers, HEADER_SERIAL).ok_or(SignatureError::MissingHeader(HEADER_SERIAL))?;

    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp(timestamp_str.to_string()))?;
    let max_skew_secs = MAX_TIMESTAMP_SKEW.as_secs();
    if now.abs_diff(timestamp) > max_skew_secs {
        return Err(SignatureError::ExpiredTimestamp {
            timestamp,
            now,
            max_skew_secs,
        });
    }

    if serial != expected_key_id {
        return Err(SignatureError::SerialMismatch {
            expected: expected_key_id.to_string(),
            got: serial.to_string(),
        });
    }

    let payload = verification_payload(timestamp_str, nonce, body);
    verify_sha256_rsa(public_key, &payload, signature)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
