//! # HTTP API
//!
//! The axum router in front of the [`TransferCoordinator`]. Handlers are
//! thin: decode, call one coordinator operation, map the outcome.
//!
//! ## Endpoints
//!
//! | Method | Path                 | Description                              |
//! |--------|----------------------|------------------------------------------|
//! | POST   | `/transfer/to_user`  | Record a transfer and submit it to PSP   |
//! | POST   | `/transfer/notify`   | PSP callback (signed, maybe encrypted)   |
//! | POST   | `/transfer/confirm`  | User confirmation; credits the balance   |
//! | GET    | `/transfer/amount`   | Balance of `?openid=`                    |
//! | GET    | `/health`            | Liveness probe                           |
//! | GET    | `/metrics`           | Prometheus exposition                    |
//!
//! ## Status codes
//!
//! Bad input is 400, as is any callback that fails verification or
//! decryption, so the PSP retries. A confirmation the state gate refuses is
//! 409. Everything on our side of the wire (store, PSP, deadlines) is 500.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use wepay_core::transfer::{ErrorKind, TransferReceipt};
use wepay_core::{TransferCoordinator, TransferError};

use crate::metrics::{self, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: TransferCoordinator,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state.metrics.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/transfer/to_user", post(transfer_to_user_handler))
        .route("/transfer/notify", post(notify_handler))
        .route("/transfer/confirm", post(confirm_handler))
        .route("/transfer/amount", get(amount_handler))
        .with_state(state)
        .merge(metrics_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Body of `POST /transfer/to_user`.
///
/// Missing fields decode to empty values and are rejected by the
/// coordinator with a message naming the field.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransferToUserBody {
    pub openid: String,
    /// Minor currency units.
    pub amount: i64,
    pub remark: String,
    /// Caller-supplied token that makes `package_info` unique.
    pub time: String,
}

/// Body of `POST /transfer/confirm`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfirmBody {
    pub mch_id: String,
    pub appid: String,
    pub package_info: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AmountQuery {
    pub openid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error body. `code` and `message` are only present when the PSP
/// answered with a structured error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Which side of the wire a failure happened on. A crypto failure on a
/// callback is the PSP's (400); on an outbound request it is ours (500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

fn status_for(kind: ErrorKind, direction: Direction) -> StatusCode {
    match kind {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::Crypto if direction == Direction::Inbound => StatusCode::BAD_REQUEST,
        ErrorKind::Guard => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Crypto
        | ErrorKind::Api
        | ErrorKind::Transport
        | ErrorKind::Store
        | ErrorKind::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A failed request, ready to be rendered.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiFailure {
    fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: error.into(),
                code: None,
                message: None,
            },
        }
    }

    fn from_transfer(err: &TransferError, direction: Direction) -> Self {
        let api = err.api_error();
        Self {
            status: status_for(err.kind(), direction),
            body: ErrorResponse {
                error: err.to_string(),
                code: api.and_then(|a| a.code.clone()),
                message: api.and_then(|a| a.message.clone()),
            },
        }
    }
}

impl From<JsonRejection> for ApiFailure {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `POST /transfer/to_user`
///
/// A PSP that cannot be reached still yields 200 with state `PROCESSING`;
/// the callback settles it later.
async fn transfer_to_user_handler(
    State(state): State<AppState>,
    body: Result<Json<TransferToUserBody>, JsonRejection>,
) -> Result<Json<TransferReceipt>, ApiFailure> {
    let Json(body) = body?;
    match state
        .coordinator
        .initiate(&body.openid, body.amount, &body.remark, &body.time)
        .await
    {
        Ok(receipt) => {
            state.metrics.transfers_initiated_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => {
            state.metrics.transfer_failures_total.inc();
            tracing::warn!(openid = %body.openid, amount = body.amount, error = %e, "transfer not initiated");
            Err(ApiFailure::from_transfer(&e, Direction::Outbound))
        }
    }
}

/// `POST /transfer/notify`
///
/// Takes the raw body: the signature covers the exact bytes, so nothing
/// may parse and re-serialize it first.
async fn notify_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiFailure> {
    state.metrics.callbacks_received_total.inc();
    match state.coordinator.on_notify(&headers, &body).await {
        Ok(outcome) => {
            tracing::debug!(
                out_bill_no = %outcome.out_bill_no,
                reported = %outcome.reported,
                transition = ?outcome.transition,
                "callback handled"
            );
            Ok(StatusCode::OK)
        }
        Err(e) => {
            state.metrics.callbacks_rejected_total.inc();
            tracing::warn!(error = %e, "callback rejected");
            Err(ApiFailure::from_transfer(&e, Direction::Inbound))
        }
    }
}

/// `POST /transfer/confirm`
async fn confirm_handler(
    State(state): State<AppState>,
    body: Result<Json<ConfirmBody>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiFailure> {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            state.metrics.confirmations_rejected_total.inc();
            return Err(rejection.into());
        }
    };
    match state
        .coordinator
        .confirm(&body.package_info, &body.mch_id, &body.appid)
        .await
    {
        Ok(outcome) => {
            state.metrics.confirmations_total.inc();
            Ok(Json(MessageResponse {
                message: format!("transfer {} confirmed", outcome.out_bill_no),
            }))
        }
        Err(e) => {
            if matches!(e.kind(), ErrorKind::Input | ErrorKind::Guard) {
                state.metrics.confirmations_rejected_total.inc();
            }
            Err(ApiFailure::from_transfer(&e, Direction::Inbound))
        }
    }
}

/// `GET /transfer/amount?openid=...`
async fn amount_handler(
    State(state): State<AppState>,
    Query(query): Query<AmountQuery>,
) -> Result<Json<i64>, ApiFailure> {
    state
        .coordinator
        .fetch_balance(&query.openid)
        .await
        .map(Json)
        .map_err(|e| ApiFailure::from_transfer(&e, Direction::Outbound))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wepay_core::config::{HEADER_SERIAL, HEADER_SIGNATURE};
    use wepay_core::storage::{TransferStore, WePayDB};
    use wepay_core::testing::{
        callback_body, set_header, signed_headers, signed_headers_at, test_coordinator, Reply,
        TEST_APPID, TEST_MCH_ID,
    };
    use wepay_core::TransferStatus;

    use crate::metrics::NodeMetrics;

    const TIME: &str = "20200420130000";
    const PACKAGE: &str = "PKo1-20200420130000";

    fn test_app(reply: Reply) -> (Router, WePayDB, SharedMetrics) {
        let (coordinator, db, _gateway) = test_coordinator(reply);
        let metrics = Arc::new(NodeMetrics::new().expect("metrics"));
        let router = create_router(AppState {
            coordinator,
            metrics: Arc::clone(&metrics),
        });
        (router, db, metrics)
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        send(router, req).await
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    async fn post_callback(router: &Router, headers: HeaderMap, body: Vec<u8>) -> StatusCode {
        let mut req = Request::builder()
            .method("POST")
            .uri("/transfer/notify")
            .body(Body::from(body))
            .unwrap();
        *req.headers_mut() = headers;
        req.headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        send(router, req).await.0
    }

    /// Initiates the S1 transfer and returns its bill number.
    async fn initiate(router: &Router) -> String {
        let (status, body) = post_json(
            router,
            "/transfer/to_user",
            serde_json::json!({
                "openid": "o1",
                "amount": 100,
                "remark": "test",
                "time": TIME,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        let receipt: serde_json::Value = serde_json::from_slice(&body).unwrap();
        receipt["out_bill_no"].as_str().unwrap().to_string()
    }

    async fn confirm(router: &Router) -> (StatusCode, Vec<u8>) {
        post_json(
            router,
            "/transfer/confirm",
            serde_json::json!({
                "mch_id": TEST_MCH_ID,
                "appid": TEST_APPID,
                "package_info": PACKAGE,
            }),
        )
        .await
    }

    async fn balance(router: &Router, openid: &str) -> i64 {
        let (status, body) = get(router, &format!("/transfer/amount?openid={openid}")).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    async fn status_of(db: &WePayDB, out_bill_no: &str) -> TransferStatus {
        db.get_status(out_bill_no).await.unwrap()
    }

    // -- Health & metrics --------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_counters() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        initiate(&router).await;

        let (status, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("wepay_transfers_initiated_total 1"));
    }

    // -- S1: happy path ----------------------------------------------------

    #[tokio::test]
    async fn happy_path_credits_the_user() {
        let (router, db, metrics) = test_app(Reply::State(TransferStatus::Processing));
        let bill = initiate(&router).await;
        assert!(bill.starts_with("Transfer_o1_100_"));
        assert_eq!(status_of(&db, &bill).await, TransferStatus::Processing);

        let body = callback_body(&bill, TransferStatus::WaitUserConfirm, 100);
        let status = post_callback(&router, signed_headers(&body), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_of(&db, &bill).await, TransferStatus::WaitUserConfirm);

        let (status, body) = confirm(&router).await;
        assert_eq!(status, StatusCode::OK);
        let msg: MessageResponse = serde_json::from_slice(&body).unwrap();
        assert!(msg.message.contains(&bill));
        assert_eq!(status_of(&db, &bill).await, TransferStatus::Success);

        assert_eq!(balance(&router, "o1").await, 100);
        assert_eq!(metrics.confirmations_total.get(), 1);
        assert_eq!(metrics.callbacks_received_total.get(), 1);
    }

    #[tokio::test]
    async fn receipt_carries_package_info_and_state() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::WaitUserConfirm));
        let (status, body) = post_json(
            &router,
            "/transfer/to_user",
            serde_json::json!({ "openid": "o1", "amount": 100, "time": TIME }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let receipt: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(receipt["package_info"], PACKAGE);
        assert_eq!(receipt["state"], "WAIT_USER_CONFIRM");
    }

    // -- S2: duplicate confirm ---------------------------------------------

    #[tokio::test]
    async fn duplicate_confirm_is_a_conflict() {
        let (router, _db, metrics) = test_app(Reply::State(TransferStatus::Processing));
        let bill = initiate(&router).await;
        let body = callback_body(&bill, TransferStatus::WaitUserConfirm, 100);
        assert_eq!(
            post_callback(&router, signed_headers(&body), body).await,
            StatusCode::OK
        );

        assert_eq!(confirm(&router).await.0, StatusCode::OK);
        let (status, body) = confirm(&router).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("SUCCESS"));

        assert_eq!(balance(&router, "o1").await, 100);
        assert_eq!(metrics.confirmations_rejected_total.get(), 1);
    }

    // -- S3: bad signature -------------------------------------------------

    #[tokio::test]
    async fn corrupted_callback_signature_is_rejected() {
        let (router, db, metrics) = test_app(Reply::State(TransferStatus::Processing));
        let bill = initiate(&router).await;

        let body = callback_body(&bill, TransferStatus::WaitUserConfirm, 100);
        let mut headers = signed_headers(&body);
        set_header(&mut headers, HEADER_SIGNATURE, "AAAA");
        assert_eq!(
            post_callback(&router, headers, body).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(&db, &bill).await, TransferStatus::Processing);
        assert_eq!(metrics.callbacks_rejected_total.get(), 1);

        assert_eq!(confirm(&router).await.0, StatusCode::CONFLICT);
        assert_eq!(balance(&router, "o1").await, 0);
    }

    // -- S4: amount invariant ----------------------------------------------

    #[tokio::test]
    async fn zero_amount_is_rejected_without_a_record() {
        let (router, db, metrics) = test_app(Reply::State(TransferStatus::Processing));
        let (status, body) = post_json(
            &router,
            "/transfer/to_user",
            serde_json::json!({ "openid": "o1", "amount": 0, "time": TIME }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("amount"));
        assert_eq!(db.transfer_count(), 0);
        assert_eq!(metrics.transfer_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        let req = Request::builder()
            .method("POST")
            .uri("/transfer/to_user")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&router, req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(!err.error.is_empty());
    }

    // -- S5: stale callback ------------------------------------------------

    #[tokio::test]
    async fn stale_callback_is_rejected() {
        let (router, db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        let bill = initiate(&router).await;

        let body = callback_body(&bill, TransferStatus::WaitUserConfirm, 100);
        let ten_minutes_ago = chrono::Utc::now().timestamp() - 600;
        let status = post_callback(&router, signed_headers_at(ten_minutes_ago, &body), body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(status_of(&db, &bill).await, TransferStatus::Processing);
    }

    // -- S6: serial mismatch -----------------------------------------------

    #[tokio::test]
    async fn callback_serial_mismatch_is_rejected() {
        let (router, db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        let bill = initiate(&router).await;

        let body = callback_body(&bill, TransferStatus::WaitUserConfirm, 100);
        let mut headers = signed_headers(&body);
        set_header(&mut headers, HEADER_SERIAL, "PUB_KEY_ID_SOMEONE_ELSE");
        assert_eq!(
            post_callback(&router, headers, body).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(&db, &bill).await, TransferStatus::Processing);
    }

    // -- Other mappings ----------------------------------------------------

    #[tokio::test]
    async fn psp_rejection_surfaces_code_and_message() {
        let (router, _db, _metrics) = test_app(Reply::Reject {
            status: 403,
            code: "NOT_ENOUGH",
            message: "insufficient balance",
        });
        let (status, body) = post_json(
            &router,
            "/transfer/to_user",
            serde_json::json!({ "openid": "o1", "amount": 100, "time": TIME }),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code.as_deref(), Some("NOT_ENOUGH"));
        assert_eq!(err.message.as_deref(), Some("insufficient balance"));
    }

    #[tokio::test]
    async fn unreachable_psp_still_returns_processing() {
        let (router, _db, _metrics) = test_app(Reply::Unreachable);
        let (status, body) = post_json(
            &router,
            "/transfer/to_user",
            serde_json::json!({ "openid": "o1", "amount": 100, "time": TIME }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let receipt: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(receipt["state"], "PROCESSING");
    }

    #[tokio::test]
    async fn callback_for_unknown_bill_is_not_found() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        let body = callback_body("Transfer_nobody_1_0", TransferStatus::WaitUserConfirm, 1);
        assert_eq!(
            post_callback(&router, signed_headers(&body), body).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn confirm_with_wrong_appid_is_a_bad_request() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        initiate(&router).await;
        let (status, _) = post_json(
            &router,
            "/transfer/confirm",
            serde_json::json!({
                "mch_id": TEST_MCH_ID,
                "appid": "wx_other",
                "package_info": PACKAGE,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn balance_of_unknown_user_is_zero() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        assert_eq!(balance(&router, "nobody").await, 0);
    }

    #[tokio::test]
    async fn balance_without_openid_is_a_bad_request() {
        let (router, _db, _metrics) = test_app(Reply::State(TransferStatus::Processing));
        assert_eq!(get(&router, "/transfer/amount").await.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn crypto_failures_depend_on_direction() {
        assert_eq!(
            status_for(ErrorKind::Crypto, Direction::Inbound),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(ErrorKind::Crypto, Direction::Outbound),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(ErrorKind::Timeout, Direction::Inbound),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
