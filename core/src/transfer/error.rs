//! Coordinator error type and its coarse classification.

use thiserror::Error;

use super::TransferStatus;
use crate::crypto::{EncryptionError, SignatureError};
use crate::psp::{ApiError, PspError};
use crate::storage::StoreError;

/// Coarse error class, used by the HTTP surface to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range caller input.
    Input,
    /// Signing, verification or decryption failed.
    Crypto,
    /// The PSP could not be reached.
    Transport,
    /// The PSP answered with a non-2xx.
    Api,
    Store,
    NotFound,
    /// A state gate rejected the operation.
    Guard,
    Timeout,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Psp(#[from] PspError),

    #[error(transparent)]
    Store(StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer {out_bill_no} is {status}, expected {expected}")]
    Guard {
        out_bill_no: String,
        status: TransferStatus,
        expected: TransferStatus,
    },

    /// Concurrent writers kept moving the record under us.
    #[error("transfer {out_bill_no} is contended, retry later")]
    Contention { out_bill_no: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => TransferError::NotFound(key),
            other => TransferError::Store(other),
        }
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidInput(_) => ErrorKind::Input,
            TransferError::Signature(_) | TransferError::Encryption(_) => ErrorKind::Crypto,
            TransferError::Psp(PspError::Transport(_)) => ErrorKind::Transport,
            TransferError::Psp(PspError::Api(_)) => ErrorKind::Api,
            TransferError::Psp(_) => ErrorKind::Crypto,
            TransferError::Store(_) | TransferError::Contention { .. } => ErrorKind::Store,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::Guard { .. } => ErrorKind::Guard,
            TransferError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// The PSP's structured error, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            TransferError::Psp(PspError::Api(e)) => Some(e),
            _ => None,
        }
    }
}
