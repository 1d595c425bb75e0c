//! # PSP Client
//!
//! One signed POST to the transfer endpoint, one verified response back.
//!
//! ```text
//! request ─► serde_json ─► build_authorization ─► POST ─┬─ 2xx ─► verify_response ─► decode
//!                                                        └─ else ─► ApiError{code, message}
//! ```
//!
//! A 2xx body whose signature does not verify is never trusted. The bytes
//! that get signed are the bytes that get sent; nothing re-serializes the
//! body in between.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{TransferToUserRequest, TransferToUserResponse};
use crate::config::{
    MerchantConfig, DEFAULT_IO_TIMEOUT, HEADER_REQUEST_ID, HEADER_SERIAL, PSP_BASE_URL,
    TRANSFER_BILLS_PATH,
};
use crate::crypto::{build_authorization, verify_response, SignatureError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A structured non-2xx answer from the PSP.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: String,
    /// `code` from the JSON body, if the body was a JSON object.
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ApiError {
    /// Build from a raw response, pulling `code` and `message` out of the
    /// body when it is a JSON object.
    pub fn from_response(status_code: u16, headers: HeaderMap, body: &[u8]) -> Self {
        let body = String::from_utf8_lossy(body).into_owned();
        let (code, message) = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map)) => {
                let field = |k: &str| map.get(k).and_then(|v| v.as_str()).map(str::to_owned);
                (field("code"), field("message"))
            }
            _ => (None, None),
        };
        Self {
            status_code,
            headers,
            body,
            code,
            message,
        }
    }

    /// The PSP `Request-Id` header, if it sent one.
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(HEADER_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "http {}: code={} message={}",
            self.status_code,
            self.code.as_deref().unwrap_or("-"),
            self.message.as_deref().unwrap_or("-")
        )
    }
}

/// Everything that can go wrong talking to the PSP.
#[derive(Debug, Error)]
pub enum PspError {
    /// Connection refused, TLS failure, timeout. The PSP may or may not
    /// have seen the request.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("PSP rejected the request: {0}")]
    Api(ApiError),

    /// The 2xx response did not carry a valid PSP signature.
    #[error("response verification failed: {0}")]
    Signature(SignatureError),

    /// The outbound request could not be signed.
    #[error("request signing failed: {0}")]
    Crypto(SignatureError),

    #[error("malformed JSON: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Gateway seam
// ---------------------------------------------------------------------------

/// Anything that can execute a transfer-to-user call. [`PspClient`] in
/// production; scripted fakes in tests.
#[async_trait]
pub trait TransferGateway: Send + Sync {
    async fn transfer_to_user(
        &self,
        request: &TransferToUserRequest,
    ) -> Result<TransferToUserResponse, PspError>;
}

// ---------------------------------------------------------------------------
// PspClient
// ---------------------------------------------------------------------------

/// HTTPS client for the PSP transfer API.
#[derive(Debug, Clone)]
pub struct PspClient {
    http: reqwest::Client,
    base_url: String,
    merchant: Arc<MerchantConfig>,
}

impl PspClient {
    /// Client against the production PSP host.
    pub fn new(merchant: Arc<MerchantConfig>) -> Result<Self, PspError> {
        Self::with_base_url(merchant, PSP_BASE_URL, DEFAULT_IO_TIMEOUT)
    }

    /// Client against an arbitrary host, e.g. a sandbox or a local mock.
    pub fn with_base_url(
        merchant: Arc<MerchantConfig>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PspError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PspError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            merchant,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sign and send `request`, then verify and decode the answer.
    pub async fn send(
        &self,
        request: &TransferToUserRequest,
    ) -> Result<TransferToUserResponse, PspError> {
        let body = serde_json::to_vec(request).map_err(|e| PspError::Decode(e.to_string()))?;
        let authorization = build_authorization(
            self.merchant.mch_id(),
            self.merchant.cert_serial(),
            Some(self.merchant.private_key()),
            "POST",
            TRANSFER_BILLS_PATH,
            &body,
        )
        .map_err(PspError::Crypto)?;

        let url = format!("{}{}", self.base_url, TRANSFER_BILLS_PATH);
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_SERIAL, self.merchant.pay_public_key_id())
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(%url, error = %e, "PSP unreachable");
                PspError::Transport(e.to_string())
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PspError::Transport(e.to_string()))?;
        let request_id = headers
            .get(HEADER_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        debug!(status = status.as_u16(), request_id, "PSP responded");

        if !status.is_success() {
            let err = ApiError::from_response(status.as_u16(), headers, &bytes);
            warn!(request_id, error = %err, "PSP returned an error");
            return Err(PspError::Api(err));
        }

        verify_response(
            self.merchant.pay_public_key_id(),
            self.merchant.pay_public_key(),
            &headers,
            &bytes,
        )
        .map_err(PspError::Signature)?;

        serde_json::from_slice(&bytes).map_err(|e| PspError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TransferGateway for PspClient {
    async fn transfer_to_user(
        &self,
        request: &TransferToUserRequest,
    ) -> Result<TransferToUserResponse, PspError> {
        self.send(request).await
    }
}
