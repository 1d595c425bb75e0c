//! # Storage Module
//!
//! Durable state for the transfer lifecycle: one record per transfer attempt
//! and one balance row per user.
//!
//! ## Backends
//!
//! ```text
//! db.rs        — WePayDB, embedded sled store (dev, tests, single node)
//! postgres.rs  — PgStore, PostgreSQL via sqlx (production)
//! ```
//!
//! Both implement [`TransferStore`] and [`BalanceStore`]. The stores are
//! deliberately dumb: they enforce uniqueness and atomicity, nothing else.
//! Which transition is legal is the coordinator's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::TransferStatus;

pub mod db;
pub mod postgres;

pub use db::WePayDB;
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors surfaced by either backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// `out_bill_no` or `package_info` already exists.
    #[error("duplicate bill: {0}")]
    DuplicateBill(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// TransferRecord
// ---------------------------------------------------------------------------

/// The authoritative artifact of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub out_bill_no: String,
    pub package_info: String,
    pub openid: String,
    pub mch_id: String,
    /// Minor currency units. Never changes after creation.
    pub amount: i64,
    pub remark: String,
    pub scene_id: String,
    pub status: TransferStatus,
    pub ctime: DateTime<Utc>,
    pub utime: DateTime<Utc>,
}

impl TransferRecord {
    /// A fresh record in `PROCESSING`, stamped now.
    pub fn new(
        out_bill_no: impl Into<String>,
        package_info: impl Into<String>,
        openid: impl Into<String>,
        mch_id: impl Into<String>,
        amount: i64,
        remark: impl Into<String>,
        scene_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            out_bill_no: out_bill_no.into(),
            package_info: package_info.into(),
            openid: openid.into(),
            mch_id: mch_id.into(),
            amount,
            remark: remark.into(),
            scene_id: scene_id.into(),
            status: TransferStatus::Processing,
            ctime: now,
            utime: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Store Traits
// ---------------------------------------------------------------------------

/// Persistence of [`TransferRecord`]s keyed by bill number.
///
/// Cancellation is future drop; deadlines are applied by the caller.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert a record. Status is forced to `PROCESSING` and both
    /// timestamps to now. Fails with [`StoreError::DuplicateBill`] if
    /// either unique key is taken.
    async fn create(&self, record: &TransferRecord) -> StoreResult<()>;

    /// Unconditionally set status and `utime`.
    async fn update_status(&self, out_bill_no: &str, status: TransferStatus) -> StoreResult<()>;

    /// Set status to `new` only if it currently is `expected`. Returns
    /// whether the write happened; `false` is not an error.
    async fn compare_and_set_status(
        &self,
        out_bill_no: &str,
        expected: TransferStatus,
        new: TransferStatus,
    ) -> StoreResult<bool>;

    async fn get_by_bill_no(&self, out_bill_no: &str) -> StoreResult<TransferRecord>;

    async fn get_by_package_info(&self, package_info: &str) -> StoreResult<TransferRecord>;

    async fn get_status(&self, out_bill_no: &str) -> StoreResult<TransferStatus>;
}

/// Per-user balances with additive upsert.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get_balance(&self, openid: &str) -> StoreResult<i64>;

    /// Add `delta` to the user's balance, creating the row if needed.
    /// Not idempotent.
    async fn credit(&self, openid: &str, delta: i64) -> StoreResult<()>;
}
