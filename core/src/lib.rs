// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # WePay Core — Merchant Payout Library
//!
//! Everything a merchant backend needs to push money from its PSP account
//! into a user's wallet without ever crediting the same transfer twice.
//!
//! The payout flow has four parties and one rule. The merchant asks the PSP
//! to transfer, the PSP calls back when the user has something to confirm,
//! the user confirms, and only then do we credit the internal balance. The
//! rule: exactly one credit per transfer, no matter how many times any of
//! those parties retries.
//!
//! ## Architecture
//!
//! - **config** — Wire constants and the immutable merchant key material.
//! - **crypto** — The signed request / verified response envelope and the
//!   AES-256-GCM callback decryption. Bit-exact or nothing.
//! - **psp** — Wire types and the HTTP client that talks to the PSP.
//! - **storage** — TransferStore and BalanceStore, over sled or PostgreSQL.
//! - **transfer** — The status graph and the coordinator that drives it.
//!
//! ## Design Philosophy
//!
//! 1. The database is the only place where state changes are decided.
//!    Every transition is a conditional update; the loser of a race finds out
//!    from the row count, not from a stale read.
//! 2. Keys are loaded once and passed around explicitly. No globals.
//! 3. An unverified byte from the PSP is not a fact.
//! 4. If it touches money, it has tests. Plural.

pub mod config;
pub mod crypto;
pub mod psp;
pub mod storage;
pub mod transfer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::MerchantConfig;
pub use transfer::{TransferCoordinator, TransferError, TransferStatus};
