//! A mock PSP served by axum on an ephemeral port, plus the key material
//! both sides of the exchange need.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use rsa::{RsaPrivateKey, RsaPublicKey};

use wepay_core::config::{
    HEADER_NONCE, HEADER_REQUEST_ID, HEADER_SERIAL, HEADER_SIGNATURE, HEADER_TIMESTAMP,
    TRANSFER_BILLS_PATH,
};
use wepay_core::crypto::envelope::{sign_response, signing_payload};
use wepay_core::crypto::keys::{parse_private_key_pem, parse_public_key_pem};
use wepay_core::crypto::signatures::verify_sha256_rsa;
use wepay_core::crypto::Authorization;
use wepay_core::MerchantConfig;

pub const MCH_ID: &str = "1900001109";
pub const CERT_SERIAL: &str = "5157F09EFDC096DE15EBE81A47057A7232F1B8E1";
pub const PAY_PUBLIC_KEY_ID: &str = "PUB_KEY_ID_0114232134912410000000000000";
pub const API_V3_KEY: &str = "0123456789abcdef0123456789ABCDEF";
pub const APPID: &str = "wxb9f4f763e5d4a6de";

pub fn merchant_private_key() -> RsaPrivateKey {
    parse_private_key_pem(include_str!("../../testdata/merchant_private_key.pem")).unwrap()
}

pub fn merchant_public_key() -> RsaPublicKey {
    parse_public_key_pem(include_str!("../../testdata/merchant_public_key.pem")).unwrap()
}

pub fn platform_private_key() -> RsaPrivateKey {
    parse_private_key_pem(include_str!("../../testdata/platform_private_key.pem")).unwrap()
}

pub fn platform_public_key() -> RsaPublicKey {
    parse_public_key_pem(include_str!("../../testdata/platform_public_key.pem")).unwrap()
}

pub fn merchant() -> Arc<MerchantConfig> {
    Arc::new(MerchantConfig::new(
        MCH_ID,
        CERT_SERIAL,
        merchant_private_key(),
        PAY_PUBLIC_KEY_ID,
        platform_public_key(),
        API_V3_KEY.as_bytes(),
    ))
}

pub fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_str(value).unwrap(),
    );
}

/// `Wechatpay-*` headers over `body`, signed by `key` at `timestamp`.
pub fn psp_headers(key: &RsaPrivateKey, timestamp: i64, body: &[u8]) -> HeaderMap {
    let timestamp = timestamp.to_string();
    let nonce = "c5ac7061fccab6bf3e254dcf98995b8c";
    let signature = sign_response(key, &timestamp, nonce, body).unwrap();
    let mut headers = HeaderMap::new();
    set_header(&mut headers, HEADER_TIMESTAMP, &timestamp);
    set_header(&mut headers, HEADER_NONCE, nonce);
    set_header(&mut headers, HEADER_SIGNATURE, &signature);
    set_header(&mut headers, HEADER_SERIAL, PAY_PUBLIC_KEY_ID);
    set_header(&mut headers, HEADER_REQUEST_ID, "08F78BB5AF0D11E9A9C8E8FD7A5C3E39");
    headers
}

// ---------------------------------------------------------------------------
// Mock PSP
// ---------------------------------------------------------------------------

/// What the mock does with the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Answer 200 with a correctly signed body in the given state.
    Accept(&'static str),
    /// Answer 400 with a PSP error body.
    Reject,
    /// Answer 200, but sign with the wrong key.
    Forge,
    /// Answer 200, signed, but ten minutes in the past.
    Stale,
}

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub signature_valid: bool,
}

pub struct MockPsp {
    behaviour: Mutex<Behaviour>,
    seen: Mutex<Vec<Seen>>,
}

impl MockPsp {
    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

/// Start the mock; returns its base URL and a handle for assertions.
pub async fn spawn_mock_psp(behaviour: Behaviour) -> (String, Arc<MockPsp>) {
    let psp = Arc::new(MockPsp {
        behaviour: Mutex::new(behaviour),
        seen: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route(TRANSFER_BILLS_PATH, post(transfer_bills))
        .with_state(Arc::clone(&psp));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), psp)
}

fn authorization_is_valid(headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(auth) = Authorization::from_str(header) else {
        return false;
    };
    let payload = signing_payload("POST", TRANSFER_BILLS_PATH, auth.timestamp, &auth.nonce, body);
    auth.mch_id == MCH_ID
        && auth.serial_no == CERT_SERIAL
        && verify_sha256_rsa(&merchant_public_key(), &payload, &auth.signature).is_ok()
}

async fn transfer_bills(
    State(psp): State<Arc<MockPsp>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature_valid = authorization_is_valid(&headers, &body);
    psp.seen.lock().unwrap().push(Seen {
        headers: headers.clone(),
        body: body.to_vec(),
        signature_valid,
    });

    if !signature_valid {
        let body = r#"{"code":"SIGN_ERROR","message":"signature mismatch"}"#;
        return (StatusCode::UNAUTHORIZED, body).into_response();
    }

    let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let out_bill_no = request["out_bill_no"].as_str().unwrap_or_default().to_string();
    let now = chrono::Utc::now().timestamp();
    let behaviour = *psp.behaviour.lock().unwrap();

    let respond = |state: &str, key: &RsaPrivateKey, timestamp: i64| {
        let body = serde_json::json!({
            "out_bill_no": out_bill_no,
            "transfer_bill_no": "1330000071100999991182020050700019480001",
            "create_time": "2015-05-20T13:29:35.120+08:00",
            "state": state,
            "package_info": "affffddafdfafddffda==",
        })
        .to_string();
        let headers = psp_headers(key, timestamp, body.as_bytes());
        (StatusCode::OK, headers, body).into_response()
    };

    match behaviour {
        Behaviour::Accept(state) => respond(state, &platform_private_key(), now),
        Behaviour::Forge => respond("WAIT_USER_CONFIRM", &merchant_private_key(), now),
        Behaviour::Stale => respond("WAIT_USER_CONFIRM", &platform_private_key(), now - 600),
        Behaviour::Reject => {
            let mut headers = HeaderMap::new();
            set_header(&mut headers, HEADER_REQUEST_ID, "08F78BB5AF0D11E9A9C8E8FD7A5C3E39");
            let body = r#"{"code":"NOT_ENOUGH","message":"insufficient balance"}"#;
            (StatusCode::FORBIDDEN, headers, body).into_response()
        }
    }
}
