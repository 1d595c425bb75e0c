//! # Transfer State Graph
//!
//! ```text
//!  PROCESSING ─┬─► ACCEPTED ─┬─► TRANSFERING ─┬─► WAIT_USER_CONFIRM ──► SUCCESS
//!              │             │                │          │
//!              └─────────────┴────────────────┴──────────┤
//!                                                        ▼
//!                                      CANCELING ─► { FAIL, CANCELLED }
//! ```
//!
//! Every non-terminal state may fall to `FAIL` or `CANCELLED`. Only
//! `WAIT_USER_CONFIRM` may reach `SUCCESS`, and that edge is reserved for
//! user confirmation because it is the one that credits the balance.
//! There are no cycles and no way out of a terminal state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer, spelled the way the PSP spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Record created, PSP not yet heard from.
    #[default]
    Processing,
    Accepted,
    Transfering,
    /// The PSP is waiting for the user to accept the money.
    WaitUserConfirm,
    Canceling,
    Cancelled,
    Success,
    Fail,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 8] = [
        TransferStatus::Processing,
        TransferStatus::Accepted,
        TransferStatus::Transfering,
        TransferStatus::WaitUserConfirm,
        TransferStatus::Canceling,
        TransferStatus::Cancelled,
        TransferStatus::Success,
        TransferStatus::Fail,
    ];

    /// Wire spelling, e.g. `WAIT_USER_CONFIRM`.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Processing => "PROCESSING",
            TransferStatus::Accepted => "ACCEPTED",
            TransferStatus::Transfering => "TRANSFERING",
            TransferStatus::WaitUserConfirm => "WAIT_USER_CONFIRM",
            TransferStatus::Canceling => "CANCELING",
            TransferStatus::Cancelled => "CANCELLED",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Fail => "FAIL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Success | TransferStatus::Fail | TransferStatus::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the graph.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;

        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            Fail | Cancelled => true,
            Success => self == WaitUserConfirm,
            Accepted => self == Processing,
            Transfering => matches!(self, Processing | Accepted),
            WaitUserConfirm => matches!(self, Processing | Accepted | Transfering),
            Canceling => matches!(self, Processing | Accepted | Transfering | WaitUserConfirm),
            Processing => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown transfer state: {s}"))
    }
}
