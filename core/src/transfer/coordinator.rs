//! # TransferCoordinator
//!
//! Drives a transfer from request to credited balance:
//!
//! ```text
//! initiate ──► store.create(PROCESSING) ──► gateway.transfer_to_user
//!                                                  │
//!                       PSP callback ──► on_notify ┴─► guarded transition
//!                                                          │
//!                     user confirmation ──► confirm ──► CAS WAIT_USER_CONFIRM→SUCCESS
//!                                                          │ (won)
//!                                                          └─► balances.credit
//! ```
//!
//! Every status write is a compare-and-set against the status that was
//! just read, so two writers racing on one bill cannot both apply. The
//! credit happens only for the caller whose CAS into `SUCCESS` wrote the
//! row; everyone else gets a guard error. That is the whole double-credit
//! defense, and it does not depend on the stores being clever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::HeaderMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{TransferError, TransferStatus};
use crate::config::{
    MerchantConfig, CALLBACK_ALGORITHM, DEFAULT_IO_TIMEOUT, DEFAULT_SCENE_REPORT_INFOS,
    DEFAULT_TRANSFER_SCENE_ID, DEFAULT_USER_RECV_PERCEPTION, MAX_TRANSITION_ATTEMPTS,
    OUT_BILL_NO_PREFIX, PACKAGE_INFO_PREFIX,
};
use crate::crypto::{decrypt_callback_resource, verify_response};
use crate::psp::{
    NotifyEnvelope, PspError, TransferGateway, TransferNotification, TransferSceneReportInfo,
    TransferToUserRequest,
};
use crate::storage::{BalanceStore, StoreError, TransferRecord, TransferStore};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-deployment knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// App the merchant is bound to at the PSP.
    pub appid: String,
    /// Where the PSP should POST callbacks.
    pub notify_url: String,
    pub transfer_scene_id: String,
    pub user_recv_perception: String,
    pub scene_report_infos: Vec<TransferSceneReportInfo>,
    /// Deadline for each store and PSP call.
    pub io_timeout: Duration,
    /// Delay of the diagnostic `PROCESSING → TRANSFERING` tick. `None`
    /// disables it.
    pub progress_tick: Option<Duration>,
}

impl TransferSettings {
    pub fn new(appid: impl Into<String>, notify_url: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            notify_url: notify_url.into(),
            transfer_scene_id: DEFAULT_TRANSFER_SCENE_ID.to_string(),
            user_recv_perception: DEFAULT_USER_RECV_PERCEPTION.to_string(),
            scene_report_infos: DEFAULT_SCENE_REPORT_INFOS
                .iter()
                .map(|(t, c)| TransferSceneReportInfo::new(*t, *c))
                .collect(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            progress_tick: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What `initiate` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub out_bill_no: String,
    pub transfer_bill_no: Option<String>,
    pub create_time: Option<String>,
    pub state: TransferStatus,
    pub package_info: String,
}

/// Result of applying a reported state to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved from the given state to the reported one.
    Applied { from: TransferStatus },
    /// The record already was in the reported state.
    Unchanged,
    /// The graph does not allow the move; the record stays where it is.
    Ignored { current: TransferStatus },
}

/// What `on_notify` did with a verified callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub out_bill_no: String,
    pub reported: TransferStatus,
    pub transition: Transition,
}

/// A successful confirmation; the balance has been credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmOutcome {
    pub out_bill_no: String,
    pub openid: String,
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Orchestrates the transfer lifecycle. Cheap to clone; share freely.
#[derive(Clone)]
pub struct TransferCoordinator {
    transfers: Arc<dyn TransferStore>,
    balances: Arc<dyn BalanceStore>,
    gateway: Arc<dyn TransferGateway>,
    merchant: Arc<MerchantConfig>,
    settings: TransferSettings,
}

impl TransferCoordinator {
    pub fn new(
        transfers: Arc<dyn TransferStore>,
        balances: Arc<dyn BalanceStore>,
        gateway: Arc<dyn TransferGateway>,
        merchant: Arc<MerchantConfig>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            transfers,
            balances,
            gateway,
            merchant,
            settings,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn merchant(&self) -> &MerchantConfig {
        &self.merchant
    }

    /// Read access to the transfer store, mostly for status queries.
    pub fn transfers(&self) -> &Arc<dyn TransferStore> {
        &self.transfers
    }

    // -- Initiate -----------------------------------------------------------

    /// Record a new transfer and ask the PSP to execute it.
    ///
    /// The record is written before the PSP is called. If the PSP cannot be
    /// reached the record stays in `PROCESSING` and a receipt is still
    /// returned; the callback decides what happened.
    pub async fn initiate(
        &self,
        openid: &str,
        amount: i64,
        remark: &str,
        time_token: &str,
    ) -> Result<TransferReceipt, TransferError> {
        if openid.trim().is_empty() {
            return Err(TransferError::InvalidInput("openid is required".into()));
        }
        if amount <= 0 {
            return Err(TransferError::InvalidInput(format!(
                "amount must be positive, got {amount}"
            )));
        }
        if time_token.trim().is_empty() {
            return Err(TransferError::InvalidInput("time is required".into()));
        }

        let out_bill_no = out_bill_no(openid, amount);
        let package_info = package_info(openid, time_token);
        let record = TransferRecord::new(
            &out_bill_no,
            &package_info,
            openid,
            self.merchant.mch_id(),
            amount,
            remark,
            &self.settings.transfer_scene_id,
        );
        self.deadline("create transfer", self.transfers.create(&record))
            .await?;
        info!(%out_bill_no, openid, amount, "transfer recorded");

        let request = self.psp_request(&record);
        let sent = tokio::time::timeout(
            self.settings.io_timeout,
            self.gateway.transfer_to_user(&request),
        )
        .await;

        let mut receipt = TransferReceipt {
            out_bill_no: out_bill_no.clone(),
            transfer_bill_no: None,
            create_time: None,
            state: TransferStatus::Processing,
            package_info,
        };

        match sent {
            Ok(Ok(response)) => {
                receipt.transfer_bill_no = response.transfer_bill_no;
                receipt.create_time = response.create_time;
                if let Some(state) = response.state {
                    debug!(%out_bill_no, %state, "PSP accepted transfer");
                    receipt.state = match self.apply(&out_bill_no, state, "psp response").await? {
                        Transition::Applied { .. } | Transition::Unchanged => state,
                        Transition::Ignored { current } => current,
                    };
                }
            }
            Ok(Err(PspError::Transport(e))) => {
                warn!(%out_bill_no, error = %e, "PSP unreachable, awaiting callback");
            }
            Err(_) => {
                warn!(%out_bill_no, "PSP call timed out, awaiting callback");
            }
            Ok(Err(PspError::Api(api))) => {
                warn!(
                    %out_bill_no,
                    request_id = api.request_id().unwrap_or(""),
                    error = %api,
                    "PSP rejected transfer"
                );
                self.mark_failed(&out_bill_no).await;
                return Err(PspError::Api(api).into());
            }
            Ok(Err(PspError::Crypto(e))) => {
                // Nothing left the process, so the attempt is dead.
                error!(%out_bill_no, error = %e, "could not sign PSP request");
                self.mark_failed(&out_bill_no).await;
                return Err(PspError::Crypto(e).into());
            }
            Ok(Err(e)) => {
                // The PSP may well have accepted this; leave it to the callback.
                error!(%out_bill_no, error = %e, "PSP response unusable");
                return Err(e.into());
            }
        }

        if receipt.state == TransferStatus::Processing {
            self.schedule_progress_tick(&out_bill_no);
        }
        Ok(receipt)
    }

    fn psp_request(&self, record: &TransferRecord) -> TransferToUserRequest {
        TransferToUserRequest {
            appid: Some(self.settings.appid.clone()),
            out_bill_no: Some(record.out_bill_no.clone()),
            transfer_scene_id: Some(record.scene_id.clone()),
            openid: Some(record.openid.clone()),
            mch_id: Some(record.mch_id.clone()),
            user_name: None,
            transfer_amount: Some(record.amount),
            transfer_remark: Some(record.remark.clone()).filter(|r| !r.is_empty()),
            notify_url: Some(self.settings.notify_url.clone()),
            user_recv_perception: Some(self.settings.user_recv_perception.clone()),
            transfer_scene_report_infos: self.settings.scene_report_infos.clone(),
        }
    }

    async fn mark_failed(&self, out_bill_no: &str) {
        if let Err(e) = self
            .apply(out_bill_no, TransferStatus::Fail, "psp error")
            .await
        {
            error!(out_bill_no, error = %e, "could not mark transfer failed");
        }
    }

    fn schedule_progress_tick(&self, out_bill_no: &str) {
        let Some(delay) = self.settings.progress_tick else {
            return;
        };
        let transfers = Arc::clone(&self.transfers);
        let out_bill_no = out_bill_no.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match transfers
                .compare_and_set_status(
                    &out_bill_no,
                    TransferStatus::Processing,
                    TransferStatus::Transfering,
                )
                .await
            {
                Ok(true) => debug!(%out_bill_no, "progress tick applied"),
                Ok(false) => debug!(%out_bill_no, "progress tick skipped, record moved on"),
                Err(e) => warn!(%out_bill_no, error = %e, "progress tick failed"),
            }
        });
    }

    // -- Callback -----------------------------------------------------------

    /// Handle a PSP callback given its raw headers and body.
    ///
    /// The signature is checked over the exact bytes received before
    /// anything in the body is believed.
    pub async fn on_notify(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<NotifyOutcome, TransferError> {
        verify_response(
            self.merchant.pay_public_key_id(),
            self.merchant.pay_public_key(),
            headers,
            body,
        )?;

        let envelope: NotifyEnvelope = serde_json::from_slice(body)
            .map_err(|e| TransferError::InvalidInput(format!("callback body: {e}")))?;
        let notification = self.open_notification(envelope)?;
        let out_bill_no = notification.out_bill_no.clone();
        if out_bill_no.is_empty() {
            return Err(TransferError::InvalidInput("out_bill_no is required".into()));
        }

        let record = self
            .deadline("load transfer", self.transfers.get_by_bill_no(&out_bill_no))
            .await?;
        if !notification.mch_id.is_empty() && notification.mch_id != self.merchant.mch_id() {
            warn!(%out_bill_no, mch_id = %notification.mch_id, "callback for another merchant");
            return Err(TransferError::InvalidInput("mch_id mismatch".into()));
        }
        if notification.transfer_amount > 0 && notification.transfer_amount != record.amount {
            warn!(
                %out_bill_no,
                reported = notification.transfer_amount,
                recorded = record.amount,
                "callback amount mismatch"
            );
            return Err(TransferError::InvalidInput("transfer_amount mismatch".into()));
        }

        let transition = self
            .apply(&out_bill_no, notification.state, "callback")
            .await?;
        Ok(NotifyOutcome {
            out_bill_no,
            reported: notification.state,
            transition,
        })
    }

    fn open_notification(
        &self,
        envelope: NotifyEnvelope,
    ) -> Result<TransferNotification, TransferError> {
        let Some(resource) = envelope.resource else {
            let out_bill_no = envelope
                .out_bill_no
                .ok_or_else(|| TransferError::InvalidInput("out_bill_no is required".into()))?;
            let state = envelope
                .state
                .ok_or_else(|| TransferError::InvalidInput("state is required".into()))?;
            return Ok(TransferNotification {
                out_bill_no,
                state,
                ..Default::default()
            });
        };

        if resource.algorithm != CALLBACK_ALGORITHM {
            return Err(TransferError::InvalidInput(format!(
                "unsupported resource algorithm: {}",
                resource.algorithm
            )));
        }
        let plain = decrypt_callback_resource(
            self.merchant.api_v3_key(),
            &resource.associated_data,
            &resource.nonce,
            &resource.ciphertext,
        )?;
        serde_json::from_slice(&plain)
            .map_err(|e| TransferError::InvalidInput(format!("callback resource: {e}")))
    }

    // -- Confirm ------------------------------------------------------------

    /// The user accepted the money: move `WAIT_USER_CONFIRM → SUCCESS` and
    /// credit the balance, exactly once.
    pub async fn confirm(
        &self,
        package_info: &str,
        mch_id: &str,
        appid: &str,
    ) -> Result<ConfirmOutcome, TransferError> {
        if package_info.is_empty() || mch_id.is_empty() || appid.is_empty() {
            return Err(TransferError::InvalidInput(
                "package_info, mch_id and appid are required".into(),
            ));
        }
        if appid != self.settings.appid {
            return Err(TransferError::InvalidInput("appid mismatch".into()));
        }

        let record = self
            .deadline(
                "load transfer",
                self.transfers.get_by_package_info(package_info),
            )
            .await?;
        if record.mch_id != mch_id {
            return Err(TransferError::InvalidInput("mch_id mismatch".into()));
        }

        let won = self
            .deadline(
                "confirm transfer",
                self.transfers.compare_and_set_status(
                    &record.out_bill_no,
                    TransferStatus::WaitUserConfirm,
                    TransferStatus::Success,
                ),
            )
            .await?;
        if !won {
            let status = self
                .deadline("load status", self.transfers.get_status(&record.out_bill_no))
                .await
                .unwrap_or(record.status);
            info!(out_bill_no = %record.out_bill_no, %status, "confirmation rejected by state gate");
            return Err(TransferError::Guard {
                out_bill_no: record.out_bill_no,
                status,
                expected: TransferStatus::WaitUserConfirm,
            });
        }

        if let Err(e) = self
            .deadline(
                "credit balance",
                self.balances.credit(&record.openid, record.amount),
            )
            .await
        {
            error!(
                out_bill_no = %record.out_bill_no,
                openid = %record.openid,
                amount = record.amount,
                error = %e,
                "transfer is SUCCESS but the balance credit failed; reconcile manually"
            );
            return Err(e);
        }

        info!(
            out_bill_no = %record.out_bill_no,
            openid = %record.openid,
            amount = record.amount,
            "transfer confirmed and credited"
        );
        Ok(ConfirmOutcome {
            out_bill_no: record.out_bill_no,
            openid: record.openid,
            amount: record.amount,
        })
    }

    // -- Balance ------------------------------------------------------------

    /// Current balance of `openid`; users never credited have 0.
    pub async fn fetch_balance(&self, openid: &str) -> Result<i64, TransferError> {
        if openid.is_empty() {
            return Err(TransferError::InvalidInput("openid is required".into()));
        }
        match tokio::time::timeout(self.settings.io_timeout, self.balances.get_balance(openid))
            .await
        {
            Ok(Ok(balance)) => Ok(balance),
            Ok(Err(StoreError::NotFound(_))) => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::Timeout {
                operation: "load balance",
            }),
        }
    }

    // -- Internals ----------------------------------------------------------

    /// Move `out_bill_no` to `target` if the graph allows it from wherever
    /// the record is now. `SUCCESS` is never applied here; only `confirm`
    /// may produce it.
    async fn apply(
        &self,
        out_bill_no: &str,
        target: TransferStatus,
        source: &'static str,
    ) -> Result<Transition, TransferError> {
        let mut current = TransferStatus::Processing;
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            current = self
                .deadline("load status", self.transfers.get_status(out_bill_no))
                .await?;
            if current == target {
                debug!(out_bill_no, %current, source, "state already recorded");
                return Ok(Transition::Unchanged);
            }
            if target == TransferStatus::Success || !current.can_transition_to(target) {
                warn!(out_bill_no, %current, %target, source, "ignoring disallowed transition");
                return Ok(Transition::Ignored { current });
            }
            let written = self
                .deadline(
                    "update status",
                    self.transfers
                        .compare_and_set_status(out_bill_no, current, target),
                )
                .await?;
            if written {
                info!(out_bill_no, from = %current, to = %target, source, "transfer state changed");
                return Ok(Transition::Applied { from: current });
            }
        }
        warn!(out_bill_no, %current, %target, source, "lost every race for the record");
        Err(TransferError::Contention {
            out_bill_no: out_bill_no.to_string(),
        })
    }

    async fn deadline<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, TransferError>
    where
        TransferError: From<E>,
    {
        match tokio::time::timeout(self.settings.io_timeout, fut).await {
            Ok(result) => result.map_err(TransferError::from),
            Err(_) => {
                warn!(operation, "deadline elapsed");
                Err(TransferError::Timeout { operation })
            }
        }
    }
}

/// `Transfer_<openid>_<amount>_<unix nanos>`.
pub fn out_bill_no(openid: &str, amount: i64) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{OUT_BILL_NO_PREFIX}{openid}_{amount}_{nanos}")
}

/// `PK<openid>-<time token>`.
pub fn package_info(openid: &str, time_token: &str) -> String {
    format!("{PACKAGE_INFO_PREFIX}{openid}-{time_token}")
}
