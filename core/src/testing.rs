//! # Test Fixtures
//!
//! Fixed keys, a PSP-side signer and a scripted gateway, so tests in this
//! crate and downstream crates can play the PSP without a network.
//!
//! Compiled for this crate's own tests and behind the `test-util` feature.
//! Everything here panics on misuse; none of it belongs on a request path.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::{
    MerchantConfig, CALLBACK_ALGORITHM, HEADER_NONCE, HEADER_SERIAL, HEADER_SIGNATURE,
    HEADER_TIMESTAMP,
};
use crate::crypto::envelope::sign_response;
use crate::crypto::keys::{parse_private_key_pem, parse_public_key_pem};
use crate::crypto::{encrypt_callback_resource, generate_nonce};
use crate::psp::{
    ApiError, NotifyEnvelope, NotifyResource, PspError, TransferGateway, TransferNotification,
    TransferToUserRequest, TransferToUserResponse,
};
use crate::storage::WePayDB;
use crate::transfer::{TransferCoordinator, TransferSettings, TransferStatus};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

pub const MERCHANT_PRIVATE_KEY_PEM: &str = include_str!("../testdata/merchant_private_key.pem");
pub const MERCHANT_PUBLIC_KEY_PEM: &str = include_str!("../testdata/merchant_public_key.pem");
pub const PLATFORM_PRIVATE_KEY_PEM: &str = include_str!("../testdata/platform_private_key.pem");
pub const PLATFORM_PUBLIC_KEY_PEM: &str = include_str!("../testdata/platform_public_key.pem");

pub const TEST_MCH_ID: &str = "1900001109";
pub const TEST_CERT_SERIAL: &str = "5157F09EFDC096DE15EBE81A47057A7232F1B8E1";
pub const TEST_PAY_PUBLIC_KEY_ID: &str = "PUB_KEY_ID_0114232134912410000000000000";
pub const TEST_API_V3_KEY: &str = "0123456789abcdef0123456789ABCDEF";
pub const TEST_APPID: &str = "wxb9f4f763e5d4a6de";
pub const TEST_NOTIFY_URL: &str = "https://merchant.example.com/transfer/notify";

/// Nonce and AAD used when sealing callback resources.
pub const TEST_RESOURCE_NONCE: &str = "fdasflkja484";
pub const TEST_RESOURCE_AAD: &str = "mch_payment";

/// Bill number the scripted PSP assigns.
pub const TEST_TRANSFER_BILL_NO: &str = "1330000071100999991182020050700019480001";

pub fn merchant_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| parse_private_key_pem(MERCHANT_PRIVATE_KEY_PEM).expect("merchant test key"))
}

pub fn merchant_public_key() -> &'static RsaPublicKey {
    static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
    KEY.get_or_init(|| parse_public_key_pem(MERCHANT_PUBLIC_KEY_PEM).expect("merchant test key"))
}

pub fn platform_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| parse_private_key_pem(PLATFORM_PRIVATE_KEY_PEM).expect("platform test key"))
}

pub fn platform_public_key() -> &'static RsaPublicKey {
    static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
    KEY.get_or_init(|| parse_public_key_pem(PLATFORM_PUBLIC_KEY_PEM).expect("platform test key"))
}

/// A merchant that signs with the merchant test key and trusts the
/// platform test key.
pub fn test_merchant() -> MerchantConfig {
    MerchantConfig::new(
        TEST_MCH_ID,
        TEST_CERT_SERIAL,
        merchant_private_key().clone(),
        TEST_PAY_PUBLIC_KEY_ID,
        platform_public_key().clone(),
        TEST_API_V3_KEY.as_bytes(),
    )
}

/// Settings with a short deadline and no progress tick.
pub fn test_settings() -> TransferSettings {
    let mut settings = TransferSettings::new(TEST_APPID, TEST_NOTIFY_URL);
    settings.io_timeout = Duration::from_secs(2);
    settings
}

// ---------------------------------------------------------------------------
// PSP-side signing
// ---------------------------------------------------------------------------

/// Set a header whose name is not a lowercase static string.
pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    headers.insert(
        HeaderName::from_bytes(name.as_bytes()).expect("header name"),
        HeaderValue::from_str(value).expect("header value"),
    );
}

/// `Wechatpay-*` headers for `body`, signed by the platform key at `timestamp`.
pub fn signed_headers_at(timestamp: i64, body: &[u8]) -> HeaderMap {
    let timestamp = timestamp.to_string();
    let nonce = generate_nonce().expect("nonce");
    let signature =
        sign_response(platform_private_key(), &timestamp, &nonce, body).expect("sign response");

    let mut headers = HeaderMap::new();
    set_header(&mut headers, HEADER_TIMESTAMP, &timestamp);
    set_header(&mut headers, HEADER_NONCE, &nonce);
    set_header(&mut headers, HEADER_SIGNATURE, &signature);
    set_header(&mut headers, HEADER_SERIAL, TEST_PAY_PUBLIC_KEY_ID);
    headers
}

/// [`signed_headers_at`] stamped with the current time.
pub fn signed_headers(body: &[u8]) -> HeaderMap {
    signed_headers_at(chrono::Utc::now().timestamp(), body)
}

/// A complete callback body with `notification` sealed under the test
/// API v3 key.
pub fn callback_body_for(notification: &TransferNotification) -> Vec<u8> {
    let plain = serde_json::to_vec(notification).expect("notification json");
    let ciphertext = encrypt_callback_resource(
        TEST_API_V3_KEY.as_bytes(),
        TEST_RESOURCE_AAD,
        TEST_RESOURCE_NONCE,
        &plain,
    )
    .expect("seal resource");
    let envelope = NotifyEnvelope {
        id: "EV-2018022511223320873".into(),
        create_time: "2015-05-20T13:29:35+08:00".into(),
        resource_type: "encrypt-resource".into(),
        event_type: "MCHTRANSFER.BILL.FINISHED".into(),
        summary: "商家转账单据终态通知".into(),
        resource: Some(NotifyResource {
            original_type: "mch_payment".into(),
            algorithm: CALLBACK_ALGORITHM.into(),
            ciphertext,
            associated_data: TEST_RESOURCE_AAD.into(),
            nonce: TEST_RESOURCE_NONCE.into(),
        }),
        out_bill_no: None,
        state: None,
    };
    serde_json::to_vec(&envelope).expect("envelope json")
}

/// Callback body for this merchant reporting `state` on `out_bill_no`.
pub fn callback_body(out_bill_no: &str, state: TransferStatus, amount: i64) -> Vec<u8> {
    callback_body_for(&TransferNotification {
        out_bill_no: out_bill_no.to_string(),
        transfer_bill_no: TEST_TRANSFER_BILL_NO.to_string(),
        state,
        mch_id: TEST_MCH_ID.to_string(),
        transfer_amount: amount,
        openid: String::new(),
        fail_reason: String::new(),
        create_time: "2015-05-20T13:29:35+08:00".into(),
        update_time: "2015-05-20T13:29:35+08:00".into(),
    })
}

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

/// How the [`ScriptedGateway`] answers every call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 2xx with this state.
    State(TransferStatus),
    /// Non-2xx with a PSP error body.
    Reject {
        status: u16,
        code: &'static str,
        message: &'static str,
    },
    /// Connection refused.
    Unreachable,
    /// Never answers.
    Hang,
}

/// In-process stand-in for the PSP.
#[derive(Debug)]
pub struct ScriptedGateway {
    reply: Reply,
    requests: Mutex<Vec<TransferToUserRequest>>,
}

impl ScriptedGateway {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<TransferToUserRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TransferGateway for ScriptedGateway {
    async fn transfer_to_user(
        &self,
        request: &TransferToUserRequest,
    ) -> Result<TransferToUserResponse, PspError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match &self.reply {
            Reply::State(state) => Ok(TransferToUserResponse {
                out_bill_no: request.out_bill_no.clone(),
                transfer_bill_no: Some(TEST_TRANSFER_BILL_NO.into()),
                create_time: Some("2015-05-20T13:29:35.120+08:00".into()),
                state: Some(*state),
                package_info: Some("affffddafdfafddffda==".into()),
            }),
            Reply::Reject {
                status,
                code,
                message,
            } => {
                let body = serde_json::json!({ "code": code, "message": message }).to_string();
                Err(PspError::Api(ApiError::from_response(
                    *status,
                    HeaderMap::new(),
                    body.as_bytes(),
                )))
            }
            Reply::Unreachable => Err(PspError::Transport("connection refused".into())),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(PspError::Transport("unreachable".into()))
            }
        }
    }
}

/// A coordinator over a temporary sled store and a scripted PSP.
pub fn test_coordinator(reply: Reply) -> (TransferCoordinator, WePayDB, Arc<ScriptedGateway>) {
    test_coordinator_with(reply, test_settings())
}

pub fn test_coordinator_with(
    reply: Reply,
    settings: TransferSettings,
) -> (TransferCoordinator, WePayDB, Arc<ScriptedGateway>) {
    let db = WePayDB::open_temporary().expect("temporary sled db");
    let gateway = Arc::new(ScriptedGateway::new(reply));
    let coordinator = TransferCoordinator::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::clone(&gateway) as Arc<dyn TransferGateway>,
        Arc::new(test_merchant()),
        settings,
    );
    (coordinator, db, gateway)
}
