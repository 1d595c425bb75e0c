//! # PgStore — PostgreSQL Backend
//!
//! Production [`TransferStore`] + [`BalanceStore`] over a shared `PgPool`.
//!
//! Uniqueness lives in the schema (primary key on `out_bill_no`, unique
//! index on `package_info`, primary key on `openid`), so a racing duplicate
//! insert fails inside PostgreSQL and surfaces as
//! [`StoreError::DuplicateBill`]. Conditional transitions are a single
//! `UPDATE … WHERE status = $expected`; the row lock taken by the update
//! serializes concurrent writers on the same bill.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{BalanceStore, StoreError, StoreResult, TransferRecord, TransferStore};
use crate::transfer::TransferStatus;

/// Statements run by [`PgStore::ensure_schema`]. Idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transfer_records (
        out_bill_no  TEXT PRIMARY KEY,
        package_info TEXT NOT NULL,
        openid       TEXT NOT NULL,
        mch_id       TEXT NOT NULL,
        amount       BIGINT NOT NULL CHECK (amount > 0),
        remark       TEXT NOT NULL DEFAULT '',
        scene_id     TEXT NOT NULL DEFAULT '',
        status       TEXT NOT NULL,
        ctime        TIMESTAMPTZ NOT NULL,
        utime        TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS transfer_records_package_info_idx
        ON transfer_records (package_info)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_balances (
        openid  TEXT PRIMARY KEY,
        balance BIGINT NOT NULL DEFAULT 0
    )
    "#,
];

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("postgres: {e}"))
}

#[derive(sqlx::FromRow)]
struct TransferRow {
    out_bill_no: String,
    package_info: String,
    openid: String,
    mch_id: String,
    amount: i64,
    remark: String,
    scene_id: String,
    status: String,
    ctime: DateTime<Utc>,
    utime: DateTime<Utc>,
}

impl TransferRow {
    fn into_record(self) -> StoreResult<TransferRecord> {
        let status = self
            .status
            .parse::<TransferStatus>()
            .map_err(StoreError::Serialization)?;
        Ok(TransferRecord {
            out_bill_no: self.out_bill_no,
            package_info: self.package_info,
            openid: self.openid,
            mch_id: self.mch_id,
            amount: self.amount,
            remark: self.remark,
            scene_id: self.scene_id,
            status,
            ctime: self.ctime,
            utime: self.utime,
        })
    }
}

const SELECT_RECORD: &str = r#"
    SELECT out_bill_no, package_info, openid, mch_id, amount, remark, scene_id,
           status, ctime, utime
    FROM transfer_records
"#;

/// PostgreSQL implementation of both stores.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(backend)?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_by(&self, column: &str, value: &str) -> StoreResult<TransferRecord> {
        let sql = format!("{SELECT_RECORD} WHERE {column} = $1");
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(value.to_string()))?
            .into_record()
    }
}

#[async_trait]
impl TransferStore for PgStore {
    async fn create(&self, record: &TransferRecord) -> StoreResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_records (
                out_bill_no, package_info, openid, mch_id, amount, remark,
                scene_id, status, ctime, utime
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(&record.out_bill_no)
        .bind(&record.package_info)
        .bind(&record.openid)
        .bind(&record.mch_id)
        .bind(record.amount)
        .bind(&record.remark)
        .bind(&record.scene_id)
        .bind(TransferStatus::Processing.as_str())
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(StoreError::DuplicateBill(record.out_bill_no.clone()))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn update_status(&self, out_bill_no: &str, status: TransferStatus) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE transfer_records SET status = $2, utime = $3 WHERE out_bill_no = $1",
        )
        .bind(out_bill_no)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(out_bill_no.to_string()));
        }
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        out_bill_no: &str,
        expected: TransferStatus,
        new: TransferStatus,
    ) -> StoreResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE transfer_records
            SET status = $3, utime = $4
            WHERE out_bill_no = $1 AND status = $2
            "#,
        )
        .bind(out_bill_no)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if done.rows_affected() == 1 {
            return Ok(true);
        }
        // Zero rows: either the gate failed or the bill does not exist.
        self.get_status(out_bill_no).await.map(|_| false)
    }

    async fn get_by_bill_no(&self, out_bill_no: &str) -> StoreResult<TransferRecord> {
        self.fetch_one_by("out_bill_no", out_bill_no).await
    }

    async fn get_by_package_info(&self, package_info: &str) -> StoreResult<TransferRecord> {
        self.fetch_one_by("package_info", package_info).await
    }

    async fn get_status(&self, out_bill_no: &str) -> StoreResult<TransferStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM transfer_records WHERE out_bill_no = $1")
                .bind(out_bill_no)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        status
            .ok_or_else(|| StoreError::NotFound(out_bill_no.to_string()))?
            .parse()
            .map_err(StoreError::Serialization)
    }
}

#[async_trait]
impl BalanceStore for PgStore {
    async fn get_balance(&self, openid: &str) -> StoreResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM user_balances WHERE openid = $1")
                .bind(openid)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        balance.ok_or_else(|| StoreError::NotFound(openid.to_string()))
    }

    async fn credit(&self, openid: &str, delta: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (openid, balance)
            VALUES ($1, $2)
            ON CONFLICT (openid) DO UPDATE
            SET balance = user_balances.balance + EXCLUDED.balance
            "#,
        )
        .bind(openid)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
