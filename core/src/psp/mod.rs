//! # PSP Integration
//!
//! Wire types for the transfer API and its callbacks, and the client that
//! speaks the signed envelope to the PSP.

pub mod client;
pub mod types;

pub use client::{ApiError, PspClient, PspError, TransferGateway};
pub use types::{
    NotifyEnvelope, NotifyResource, TransferNotification, TransferSceneReportInfo,
    TransferToUserRequest, TransferToUserResponse,
};
