//! End-to-end payout scenarios: real PspClient, mock PSP, sled store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    platform_private_key, psp_headers, set_header, spawn_mock_psp, Behaviour, API_V3_KEY, APPID,
    MCH_ID,
};
use wepay_core::config::{CALLBACK_ALGORITHM, HEADER_SIGNATURE};
use wepay_core::crypto::encrypt_callback_resource;
use wepay_core::psp::PspClient;
use wepay_core::storage::{BalanceStore, TransferStore, WePayDB};
use wepay_core::transfer::{ErrorKind, TransferSettings};
use wepay_core::{TransferCoordinator, TransferStatus};

const TIME: &str = "20200420130000";
const PACKAGE: &str = "PKo1-20200420130000";

async fn coordinator(behaviour: Behaviour) -> (TransferCoordinator, WePayDB) {
    let (base_url, _psp) = spawn_mock_psp(behaviour).await;
    let merchant = common::merchant();
    let client = PspClient::with_base_url(Arc::clone(&merchant), base_url, Duration::from_secs(5))
        .unwrap();
    let db = WePayDB::open_temporary().unwrap();
    let settings = TransferSettings::new(APPID, "https://merchant.example.com/transfer/notify");
    let coordinator = TransferCoordinator::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(client),
        merchant,
        settings,
    );
    (coordinator, db)
}

fn callback(out_bill_no: &str, state: &str) -> Vec<u8> {
    let plain = serde_json::json!({
        "out_bill_no": out_bill_no,
        "transfer_bill_no": "1330000071100999991182020050700019480001",
        "state": state,
        "mch_id": MCH_ID,
        "transfer_amount": 100,
        "openid": "o1",
        "create_time": "2015-05-20T13:29:35+08:00",
        "update_time": "2015-05-20T13:29:35+08:00",
    })
    .to_string();
    let ciphertext =
        encrypt_callback_resource(API_V3_KEY.as_bytes(), "mch_payment", "fdasflkja484", plain.as_bytes())
            .unwrap();
    serde_json::json!({
        "id": "EV-2018022511223320873",
        "create_time": "2015-05-20T13:29:35+08:00",
        "resource_type": "encrypt-resource",
        "event_type": "MCHTRANSFER.BILL.FINISHED",
        "summary": "商家转账单据终态通知",
        "resource": {
            "original_type": "mch_payment",
            "algorithm": CALLBACK_ALGORITHM,
            "ciphertext": ciphertext,
            "associated_data": "mch_payment",
            "nonce": "fdasflkja484",
        }
    })
    .to_string()
    .into_bytes()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[tokio::test]
async fn happy_path_credits_the_user() {
    let (coordinator, db) = coordinator(Behaviour::Accept("PROCESSING")).await;

    let receipt = coordinator.initiate("o1", 100, "test", TIME).await.unwrap();
    assert!(receipt.out_bill_no.starts_with("Transfer_o1_100_"));
    assert_eq!(receipt.package_info, PACKAGE);
    assert_eq!(db.get_status(&receipt.out_bill_no).await.unwrap(), TransferStatus::Processing);

    let body = callback(&receipt.out_bill_no, "WAIT_USER_CONFIRM");
    let headers = psp_headers(&platform_private_key(), now(), &body);
    coordinator.on_notify(&headers, &body).await.unwrap();
    assert_eq!(
        db.get_status(&receipt.out_bill_no).await.unwrap(),
        TransferStatus::WaitUserConfirm
    );

    coordinator.confirm(PACKAGE, MCH_ID, APPID).await.unwrap();
    assert_eq!(db.get_status(&receipt.out_bill_no).await.unwrap(), TransferStatus::Success);
    assert_eq!(db.get_balance("o1").await.unwrap(), 100);
    assert_eq!(coordinator.fetch_balance("o1").await.unwrap(), 100);
}

#[tokio::test]
async fn duplicate_confirm_does_not_credit_twice() {
    let (coordinator, _db) = coordinator(Behaviour::Accept("WAIT_USER_CONFIRM")).await;
    coordinator.initiate("o1", 100, "test", TIME).await.unwrap();

    coordinator.confirm(PACKAGE, MCH_ID, APPID).await.unwrap();
    let err = coordinator.confirm(PACKAGE, MCH_ID, APPID).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert_eq!(coordinator.fetch_balance("o1").await.unwrap(), 100);
}

#[tokio::test]
async fn forged_callback_leaves_record_untouched() {
    let (coordinator, db) = coordinator(Behaviour::Accept("PROCESSING")).await;
    let receipt = coordinator.initiate("o1", 100, "test", TIME).await.unwrap();

    let body = callback(&receipt.out_bill_no, "WAIT_USER_CONFIRM");
    let mut headers = psp_headers(&platform_private_key(), now(), &body);
    set_header(&mut headers, HEADER_SIGNATURE, "AAAA");
    let err = coordinator.on_notify(&headers, &body).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Crypto);

    assert_eq!(db.get_status(&receipt.out_bill_no).await.unwrap(), TransferStatus::Processing);
    let err = coordinator.confirm(PACKAGE, MCH_ID, APPID).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
}

#[tokio::test]
async fn rejected_transfer_is_failed_and_reported() {
    let (coordinator, db) = coordinator(Behaviour::Reject).await;
    let err = coordinator.initiate("o1", 100, "test", TIME).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Api);
    assert_eq!(err.api_error().unwrap().code.as_deref(), Some("NOT_ENOUGH"));
    assert_eq!(db.get_by_package_info(PACKAGE).await.unwrap().status, TransferStatus::Fail);
}

#[tokio::test]
async fn unverifiable_response_keeps_record_processing() {
    let (coordinator, db) = coordinator(Behaviour::Forge).await;
    let err = coordinator.initiate("o1", 100, "test", TIME).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Crypto);
    // The PSP may have accepted it, so the record waits for the callback.
    assert_eq!(
        db.get_by_package_info(PACKAGE).await.unwrap().status,
        TransferStatus::Processing
    );
}
