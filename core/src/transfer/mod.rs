//! # Transfer Lifecycle
//!
//! The state graph, the coordinator that walks records through it, and the
//! error type the coordinator reports to callers.

pub mod coordinator;
pub mod error;
pub mod status;

pub use coordinator::{
    ConfirmOutcome, NotifyOutcome, TransferCoordinator, TransferReceipt, TransferSettings,
    Transition,
};
pub use error::{ErrorKind, TransferError};
pub use status::TransferStatus;
