//! # WePayDB — Embedded Storage Engine
//!
//! A [`TransferStore`] + [`BalanceStore`] on sled's embedded key-value store.
//! Used for development, tests and single-node deployments that do not want
//! a PostgreSQL server.
//!
//! ## Tree Layout
//!
//! | Tree            | Key                    | Value                     |
//! |-----------------|------------------------|---------------------------|
//! | `transfers`     | `out_bill_no` (UTF-8)  | `bincode(TransferRecord)` |
//! | `package_index` | `package_info` (UTF-8) | `out_bill_no` (UTF-8)     |
//! | `balances`      | `openid` (UTF-8)       | balance (8B BE `i64`)     |
//!
//! ## Atomicity
//!
//! `create` writes the record and its package index entry in one sled
//! transaction spanning both trees, so both unique keys are claimed
//! together or not at all. Status changes run as single-tree transactions:
//! read, compare, write, retried by sled on conflict. Credits use sled's
//! `update_and_fetch` CAS loop, so two concurrent credits never lose an
//! update.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, Transactional, Tree};

use super::{BalanceStore, StoreError, StoreResult, TransferRecord, TransferStore};
use crate::transfer::TransferStatus;

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(format!("sled: {e}"))
    }
}

fn from_tx(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

fn encode(record: &TransferRecord) -> StoreResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> StoreResult<TransferRecord> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_balance(bytes: &[u8]) -> StoreResult<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("invalid balance bytes".to_string()))?;
    Ok(i64::from_be_bytes(raw))
}

// ---------------------------------------------------------------------------
// WePayDB
// ---------------------------------------------------------------------------

/// sled-backed transfer and balance store.
///
/// Cheap to clone; all clones share the same database. sled serializes
/// conflicting writers internally, so no external locking is needed.
#[derive(Debug, Clone)]
pub struct WePayDB {
    db: Db,
    transfers: Tree,
    package_index: Tree,
    balances: Tree,
}

impl WePayDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a database that is removed when the last handle is dropped.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let transfers = db.open_tree("transfers")?;
        let package_index = db.open_tree("package_index")?;
        let balances = db.open_tree("balances")?;
        Ok(Self {
            db,
            transfers,
            package_index,
            balances,
        })
    }

    /// Number of transfer records ever created.
    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    /// Number of users holding a balance row.
    pub fn balance_count(&self) -> usize {
        self.balances.len()
    }

    /// Rewrite the status of a record inside a transaction. With
    /// `expected` set, the write only happens if the current status
    /// matches; the return value tells whether it did.
    fn rewrite_status(
        &self,
        out_bill_no: &str,
        expected: Option<TransferStatus>,
        new: TransferStatus,
    ) -> StoreResult<bool> {
        let written = self
            .transfers
            .transaction(|tx| -> ConflictableTransactionResult<bool, StoreError> {
                let bytes = tx.get(out_bill_no.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(StoreError::NotFound(
                        out_bill_no.to_string(),
                    ))
                })?;
                let mut record = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if expected.is_some_and(|expected| record.status != expected) {
                    return Ok(false);
                }
                record.status = new;
                record.utime = Utc::now();
                let bytes = encode(&record).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(out_bill_no.as_bytes(), bytes)?;
                Ok(true)
            })
            .map_err(from_tx)?;
        if written {
            self.db.flush()?;
        }
        Ok(written)
    }
}

#[async_trait]
impl TransferStore for WePayDB {
    async fn create(&self, record: &TransferRecord) -> StoreResult<()> {
        let now = Utc::now();
        let mut record = record.clone();
        record.status = TransferStatus::Processing;
        record.ctime = now;
        record.utime = now;
        let bytes = encode(&record)?;

        (&self.transfers, &self.package_index)
            .transaction(
                |(transfers, index)| -> ConflictableTransactionResult<(), StoreError> {
                    if transfers.get(record.out_bill_no.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::DuplicateBill(record.out_bill_no.clone()),
                        ));
                    }
                    if index.get(record.package_info.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::DuplicateBill(format!(
                                "package_info {}",
                                record.package_info
                            )),
                        ));
                    }
                    transfers.insert(record.out_bill_no.as_bytes(), bytes.as_slice())?;
                    index.insert(
                        record.package_info.as_bytes(),
                        record.out_bill_no.as_bytes(),
                    )?;
                    Ok(())
                },
            )
            .map_err(from_tx)?;

        self.db.flush()?;
        Ok(())
    }

    async fn update_status(&self, out_bill_no: &str, status: TransferStatus) -> StoreResult<()> {
        self.rewrite_status(out_bill_no, None, status).map(|_| ())
    }

    async fn compare_and_set_status(
        &self,
        out_bill_no: &str,
        expected: TransferStatus,
        new: TransferStatus,
    ) -> StoreResult<bool> {
        self.rewrite_status(out_bill_no, Some(expected), new)
    }

    async fn get_by_bill_no(&self, out_bill_no: &str) -> StoreResult<TransferRecord> {
        match self.transfers.get(out_bill_no.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(out_bill_no.to_string())),
        }
    }

    async fn get_by_package_info(&self, package_info: &str) -> StoreResult<TransferRecord> {
        let bill = self
            .package_index
            .get(package_info.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(package_info.to_string()))?;
        let out_bill_no = std::str::from_utf8(&bill)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.get_by_bill_no(out_bill_no).await
    }

    async fn get_status(&self, out_bill_no: &str) -> StoreResult<TransferStatus> {
        Ok(self.get_by_bill_no(out_bill_no).await?.status)
    }
}

#[async_trait]
impl BalanceStore for WePayDB {
    async fn get_balance(&self, openid: &str) -> StoreResult<i64> {
        match self.balances.get(openid.as_bytes())? {
            Some(bytes) => decode_balance(&bytes),
            None => Err(StoreError::NotFound(openid.to_string())),
        }
    }

    async fn credit(&self, openid: &str, delta: i64) -> StoreResult<()> {
        // Refuse to touch a row we cannot read rather than overwrite it.
        if let Some(bytes) = self.balances.get(openid.as_bytes())? {
            decode_balance(&bytes)?;
        }
        self.balances.update_and_fetch(openid.as_bytes(), |old| {
            let current = old
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            Some(current.saturating_add(delta).to_be_bytes().to_vec())
        })?;
        self.db.flush()?;
        Ok(())
    }
}
