//! # PSP Wire Types
//!
//! JSON shapes exchanged with the PSP's transfer API. Optional request
//! fields are `Option`s that are *omitted* when absent, never sent as
//! `null`; the PSP rejects explicit nulls on several of them.

use serde::{Deserialize, Serialize};

use crate::transfer::TransferStatus;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// One `transfer_scene_report_infos[]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSceneReportInfo {
    pub info_type: String,
    pub info_content: String,
}

impl TransferSceneReportInfo {
    pub fn new(info_type: impl Into<String>, info_content: impl Into<String>) -> Self {
        Self {
            info_type: info_type.into(),
            info_content: info_content.into(),
        }
    }
}

/// Body of `POST /v3/fund-app/mch-transfer/transfer-bills`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToUserRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_bill_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mch_id: Option<String>,
    /// Real name of the payee, encrypted with the PSP public key. Only
    /// required above the PSP's real-name threshold; we never send it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_remark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_recv_perception: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfer_scene_report_infos: Vec<TransferSceneReportInfo>,
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Successful response of the transfer endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToUserResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_bill_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bill_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_info: Option<String>,
}

/// Outer JSON of a PSP callback. Everything except `resource` is in clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<NotifyResource>,
    /// Plain-text fallback when no `resource` block is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_bill_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferStatus>,
}

/// The encrypted `resource` block of a callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResource {
    #[serde(default)]
    pub original_type: String,
    pub algorithm: String,
    pub ciphertext: String,
    #[serde(default)]
    pub associated_data: String,
    pub nonce: String,
}

/// Decrypted content of `resource.ciphertext`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotification {
    pub out_bill_no: String,
    #[serde(default)]
    pub transfer_bill_no: String,
    pub state: TransferStatus,
    #[serde(default)]
    pub mch_id: String,
    #[serde(default)]
    pub transfer_amount: i64,
    #[serde(default)]
    pub openid: String,
    #[serde(default)]
    pub fail_reason: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
}
