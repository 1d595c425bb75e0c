//! # Prometheus Metrics
//!
//! Operational counters for the payout service, scraped at `GET /metrics`.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] prefixed
//! `wepay`, so they never collide with the default global registry.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

use wepay_core::psp::{PspError, TransferGateway, TransferToUserRequest, TransferToUserResponse};

/// Every metric handle the node records into.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Transfers recorded and sent to the PSP.
    pub transfers_initiated_total: IntCounter,
    /// Initiations that ended in an error response.
    pub transfer_failures_total: IntCounter,
    /// Callbacks received, accepted or not.
    pub callbacks_received_total: IntCounter,
    /// Callbacks answered with a non-2xx, so the PSP will retry.
    pub callbacks_rejected_total: IntCounter,
    /// Confirmations that credited a balance.
    pub confirmations_total: IntCounter,
    /// Confirmations refused by input checks or the state gate.
    pub confirmations_rejected_total: IntCounter,
    /// Round-trip latency of PSP transfer calls.
    pub psp_request_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("wepay".into()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let transfers_initiated_total = counter(
            "transfers_initiated_total",
            "Transfers recorded and submitted to the PSP",
        )?;
        let transfer_failures_total = counter(
            "transfer_failures_total",
            "Transfer initiations that returned an error",
        )?;
        let callbacks_received_total =
            counter("callbacks_received_total", "PSP callbacks received")?;
        let callbacks_rejected_total = counter(
            "callbacks_rejected_total",
            "PSP callbacks rejected with a non-2xx status",
        )?;
        let confirmations_total = counter(
            "confirmations_total",
            "Confirmations that moved a transfer to SUCCESS",
        )?;
        let confirmations_rejected_total = counter(
            "confirmations_rejected_total",
            "Confirmations refused by validation or the state gate",
        )?;

        let psp_request_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "psp_request_seconds",
                "Latency of transfer calls to the PSP in seconds",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(psp_request_seconds.clone()))?;

        Ok(Self {
            registry,
            transfers_initiated_total,
            transfer_failures_total,
            callbacks_received_total,
            callbacks_rejected_total,
            confirmations_total,
            confirmations_rejected_total,
            psp_request_seconds,
        })
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Instrumented gateway
// ---------------------------------------------------------------------------

/// Wraps a [`TransferGateway`] and times every call into
/// `psp_request_seconds`, successful or not.
pub struct InstrumentedGateway<G> {
    inner: G,
    metrics: SharedMetrics,
}

impl<G> InstrumentedGateway<G> {
    pub fn new(inner: G, metrics: SharedMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<G: TransferGateway> TransferGateway for InstrumentedGateway<G> {
    async fn transfer_to_user(
        &self,
        request: &TransferToUserRequest,
    ) -> Result<TransferToUserResponse, PspError> {
        let started = Instant::now();
        let result = self.inner.transfer_to_user(request).await;
        self.metrics
            .psp_request_seconds
            .observe(started.elapsed().as_secs_f64());
        result
    }
}
