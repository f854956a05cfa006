//! API Integration Tests
//!
//! Drives the router end to end against the in-memory store: signed webhook
//! in, allocation and ledger state out.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use splitledger_allocation::{
    AllocationEngine, EngineConfig, LoggingTransferSink, TransferError, TransferReceipt,
    TransferRequest, TransferSink,
};
use splitledger_api::{create_test_router, AppState};
use splitledger_crypto::{sign, WebhookVerifier};
use splitledger_db::{
    AllocationStore, IdempotencyGuard, LedgerStore, MemoryIdempotencyStore, MemoryStore,
    TransactionStore,
};
use splitledger_types::{AllocationStatus, BeneficiaryShare, SplitConfig, GENESIS_HASH};

const SECRET: &str = "whsec_integration";
const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

// =============================================================================
// Fixtures
// =============================================================================

struct RejectingSink;

#[async_trait]
impl TransferSink for RejectingSink {
    async fn transfer(&self, _request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        Err(TransferError::Rejected { status: 502 })
    }
}

fn share(name: &str, percent: rust_decimal::Decimal) -> BeneficiaryShare {
    BeneficiaryShare {
        name: name.to_string(),
        percent,
        account_ref: format!("acct_{name}"),
    }
}

fn three_way_split() -> SplitConfig {
    SplitConfig {
        shares: vec![
            share("operations", dec!(70)),
            share("reserve", dec!(20)),
            share("founder", dec!(10)),
        ],
        primary: "operations".to_string(),
    }
}

fn single_beneficiary_split() -> SplitConfig {
    SplitConfig {
        shares: vec![
            share("operations", dec!(100)),
            share("reserve", dec!(0)),
            share("founder", dec!(0)),
        ],
        primary: "operations".to_string(),
    }
}

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
}

struct HarnessBuilder {
    split: SplitConfig,
    secret: Option<String>,
    sink: Arc<dyn TransferSink>,
    max_attempts: u32,
    idempotency: IdempotencyGuard,
    signature_header: Option<String>,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            split: three_way_split(),
            secret: Some(SECRET.to_string()),
            sink: Arc::new(LoggingTransferSink::new()),
            max_attempts: 3,
            idempotency: IdempotencyGuard::in_memory(),
            signature_header: None,
        }
    }

    fn split(mut self, split: SplitConfig) -> Self {
        self.split = split;
        self
    }

    fn secret(mut self, secret: Option<&str>) -> Self {
        self.secret = secret.map(str::to_string);
        self
    }

    fn sink(mut self, sink: Arc<dyn TransferSink>) -> Self {
        self.sink = sink;
        self
    }

    fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn idempotency(mut self, idempotency: IdempotencyGuard) -> Self {
        self.idempotency = idempotency;
        self
    }

    fn signature_header(mut self, header: &str) -> Self {
        self.signature_header = Some(header.to_string());
        self
    }

    fn build(self) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn LedgerStore> = store.clone();
        let config = EngineConfig::new(self.split).with_max_attempts(self.max_attempts);
        let engine = Arc::new(AllocationEngine::new(dyn_store.clone(), self.sink, config).unwrap());

        let mut state = AppState::new(
            dyn_store,
            self.idempotency,
            WebhookVerifier::new(self.secret),
            engine,
        );
        if let Some(header) = self.signature_header {
            state = state.with_signature_header(&header);
        }

        Harness {
            router: create_test_router(Arc::new(state)),
            store,
        }
    }
}

fn payment_event(payment_id: &str, amount: i64, status: &str) -> Value {
    json!({
        "type": "payment.updated",
        "event_id": format!("evt_{payment_id}"),
        "merchant_id": "M123",
        "data": {
            "type": "payment",
            "id": payment_id,
            "object": {
                "payment": {
                    "id": payment_id,
                    "amount_money": { "amount": amount, "currency": "USD" },
                    "status": status,
                    "reference_id": "subscription:pro"
                }
            }
        }
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body_bytes).unwrap_or(json!(null));

    (status, json)
}

/// GET request returning status and JSON body
async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(router, request).await
}

/// POST a raw webhook body with an optional signature header
async fn post_webhook(
    router: &Router,
    header: &str,
    body: &[u8],
    signature: Option<String>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .header("Content-Type", "application/json");
    if let Some(signature) = signature {
        request = request.header(header, signature);
    }
    send(router, request.body(Body::from(body.to_vec())).unwrap()).await
}

/// POST a webhook signed with the shared secret
async fn post_signed(router: &Router, event: &Value) -> (StatusCode, Value) {
    let body = serde_json::to_vec(event).unwrap();
    let signature = sign(&body, SECRET);
    post_webhook(router, SIGNATURE_HEADER, &body, Some(signature)).await
}

// =============================================================================
// Webhook ingestion
// =============================================================================

#[cfg(test)]
mod webhook {
    use super::*;

    #[tokio::test]
    async fn test_completed_payment_is_recorded_and_allocated() {
        let harness = HarnessBuilder::new().build();

        let (status, json) = post_signed(&harness.router, &payment_event("pay_100", 1499, "COMPLETED")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "processed");
        assert!(json.get("allocationStatus").is_none());
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);

        let transaction = harness.store.find_by_external_id("pay_100").await.unwrap().unwrap();
        assert_eq!(transaction.amount_minor, 1499);
        let allocation = harness
            .store
            .find_allocation_by_transaction(&transaction.id)
            .await
            .unwrap()
            .unwrap();
        let amounts: Vec<i64> = allocation.shares.iter().map(|s| s.amount_minor).collect();
        assert_eq!(amounts, vec![1051, 299, 149]);
        assert!(allocation.shares.iter().all(|s| s.transfer_ref.is_some()));
    }

    #[tokio::test]
    async fn test_single_beneficiary_first_entry_links_to_genesis() {
        let harness = HarnessBuilder::new().split(single_beneficiary_split()).build();

        let (status, json) = post_signed(&harness.router, &payment_event("pay_1", 1499, "COMPLETED")).await;
        assert_eq!(status, StatusCode::OK);

        let allocation_id = json["allocationId"].as_str().unwrap().to_string();
        let (status, allocation) = get_json(&harness.router, &format!("/api/v1/allocations/{allocation_id}")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(allocation["status"], "COMPLETED");
        assert_eq!(allocation["previous_hash"], GENESIS_HASH);
        assert_eq!(allocation["shares"][0]["amount_minor"], 1499);
        assert_eq!(allocation["shares"][1]["amount_minor"], 0);
        assert_eq!(allocation["shares"][2]["amount_minor"], 0);
        assert!(allocation["shares"][1]["transfer_ref"].is_null());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_acknowledged_once() {
        let harness = HarnessBuilder::new().build();
        let event = payment_event("pay_dup", 2500, "COMPLETED");

        let (_, first) = post_signed(&harness.router, &event).await;
        let (status, second) = post_signed(&harness.router, &event).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "processed");
        assert_eq!(second["status"], "already_processed");
        assert_eq!(second["allocationId"], first["allocationId"]);
        assert_eq!(second["hash"], first["hash"]);
        assert_eq!(harness.store.count_transactions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_record_one_transaction() {
        let harness = HarnessBuilder::new().build();
        let event = payment_event("pay_race", 1000, "COMPLETED");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = harness.router.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move { post_signed(&router, &event).await }));
        }

        let mut processed = 0;
        for handle in handles {
            let (status, json) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            if json["status"] == "processed" {
                processed += 1;
            } else {
                assert_eq!(json["status"], "already_processed");
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(harness.store.count_transactions().await.unwrap(), 1);
        assert_eq!(harness.store.list_chain().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_idempotency_entry_still_deduplicated() {
        let guard = IdempotencyGuard::new(
            Arc::new(MemoryIdempotencyStore::new()),
            chrono::Duration::zero(),
            10,
        );
        let harness = HarnessBuilder::new().idempotency(guard).build();
        let event = payment_event("pay_ttl", 700, "COMPLETED");

        post_signed(&harness.router, &event).await;
        let (status, json) = post_signed(&harness.router, &event).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "already_processed");
        assert_eq!(harness.store.count_transactions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_payment_event_ignored() {
        let harness = HarnessBuilder::new().build();
        let event = json!({ "type": "refund.created", "data": { "object": {} } });

        let (status, json) = post_signed(&harness.router, &event).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ignored");
        assert_eq!(harness.store.count_transactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uncompleted_payment_pending() {
        let harness = HarnessBuilder::new().build();

        let (status, json) = post_signed(&harness.router, &payment_event("pay_wait", 1499, "APPROVED")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "pending");
        assert_eq!(harness.store.count_transactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let harness = HarnessBuilder::new().build();
        let body = b"{not json";

        let (status, json) =
            post_webhook(&harness.router, SIGNATURE_HEADER, body, Some(sign(body, SECRET))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1100);
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let harness = HarnessBuilder::new().build();

        let (status, json) = post_signed(&harness.router, &payment_event("pay_zero", 0, "COMPLETED")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1100);
        assert_eq!(harness.store.count_transactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfers_leave_allocation_retrying() {
        let harness = HarnessBuilder::new().sink(Arc::new(RejectingSink)).build();

        let (status, json) = post_signed(&harness.router, &payment_event("pay_retry", 1499, "COMPLETED")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "processed");
        assert!(json.get("allocationStatus").is_none());
        assert!(json.get("hash").is_none());

        let allocation_id = json["allocationId"].as_str().unwrap();
        let (status, json) = get_json(&harness.router, &format!("/api/v1/allocations/{allocation_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "RETRYING");
        assert!(json["hash"].is_null());
    }
}

// =============================================================================
// Signature verification
// =============================================================================

#[cfg(test)]
mod signatures {
    use super::*;

    #[tokio::test]
    async fn test_wrong_secret_forbidden() {
        let harness = HarnessBuilder::new().build();
        let body = serde_json::to_vec(&payment_event("pay_forged", 1499, "COMPLETED")).unwrap();

        let (status, json) = post_webhook(
            &harness.router,
            SIGNATURE_HEADER,
            &body,
            Some(sign(&body, "attacker-secret")),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["code"], -1022);
        assert!(harness.store.find_by_external_id("pay_forged").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_signature_forbidden() {
        let harness = HarnessBuilder::new().build();
        let body = serde_json::to_vec(&payment_event("pay_unsigned", 1499, "COMPLETED")).unwrap();

        let (status, json) = post_webhook(&harness.router, SIGNATURE_HEADER, &body, None).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["code"], -1021);
        assert_eq!(harness.store.count_transactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_secret_unavailable() {
        let harness = HarnessBuilder::new().secret(None).build();
        let body = serde_json::to_vec(&payment_event("pay_nosecret", 1499, "COMPLETED")).unwrap();

        let (status, json) =
            post_webhook(&harness.router, SIGNATURE_HEADER, &body, Some(sign(&body, ""))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], -1001);
        assert_eq!(harness.store.count_transactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserialized_body_fails_verification() {
        let harness = HarnessBuilder::new().build();
        let compact = serde_json::to_vec(&payment_event("pay_ws", 1499, "COMPLETED")).unwrap();
        let pretty = serde_json::to_vec_pretty(&payment_event("pay_ws", 1499, "COMPLETED")).unwrap();

        let (status, _) =
            post_webhook(&harness.router, SIGNATURE_HEADER, &pretty, Some(sign(&compact, SECRET))).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_custom_signature_header() {
        let harness = HarnessBuilder::new().signature_header("Stripe-Signature").build();
        let body = serde_json::to_vec(&payment_event("pay_hdr", 500, "COMPLETED")).unwrap();

        let (status, _) =
            post_webhook(&harness.router, SIGNATURE_HEADER, &body, Some(sign(&body, SECRET))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) =
            post_webhook(&harness.router, "stripe-signature", &body, Some(sign(&body, SECRET))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "processed");
    }
}

// =============================================================================
// Operator endpoints
// =============================================================================

#[cfg(test)]
mod operator {
    use super::*;

    #[tokio::test]
    async fn test_get_transaction_with_allocation() {
        let harness = HarnessBuilder::new().build();
        post_signed(&harness.router, &payment_event("pay_view", 1499, "COMPLETED")).await;
        let transaction = harness.store.find_by_external_id("pay_view").await.unwrap().unwrap();

        let (status, json) =
            get_json(&harness.router, &format!("/api/v1/transactions/{}", transaction.id)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["external_payment_id"], "pay_view");
        assert_eq!(json["amount"], "14.99");
        assert_eq!(json["source"], "subscription");
        assert_eq!(json["allocation"]["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_unknown_ids_not_found() {
        let harness = HarnessBuilder::new().build();
        let id = uuid::Uuid::new_v4();

        let (status, json) = get_json(&harness.router, &format!("/api/v1/transactions/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], -4000);

        let (status, _) = get_json(&harness.router, &format!("/api/v1/allocations/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_ids_rejected() {
        let harness = HarnessBuilder::new().build();

        let (status, json) = get_json(&harness.router, "/api/v1/transactions/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], -1102);

        let (status, _) = get_json(&harness.router, "/api/v1/allocations/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_terminal_failures_listed() {
        let harness = HarnessBuilder::new()
            .sink(Arc::new(RejectingSink))
            .max_attempts(1)
            .build();
        post_signed(&harness.router, &payment_event("pay_stuck", 1499, "COMPLETED")).await;

        let (status, json) = get_json(&harness.router, "/api/v1/allocations").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["data"][0]["status"], "FAILED");
        assert_eq!(json["data"][0]["attempt_count"], 1);
        assert!(json["data"][0]["error_message"]
            .as_str()
            .unwrap()
            .contains("502"));

        let (status, json) = get_json(&harness.router, "/api/v1/allocations?status=completed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_status_filter_rejected() {
        let harness = HarnessBuilder::new().build();

        let (status, _) = get_json(&harness.router, "/api/v1/allocations?status=exploded").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ledger_verification_detects_tampering() {
        let harness = HarnessBuilder::new().build();
        for i in 0..3 {
            post_signed(&harness.router, &payment_event(&format!("pay_chain_{i}"), 1000 + i, "COMPLETED")).await;
        }

        let (status, json) = get_json(&harness.router, "/api/v1/ledger/verify").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "valid");
        assert_eq!(json["length"], 3);

        let mut middle = harness.store.list_chain().await.unwrap()[1].clone();
        middle.shares[0].amount_minor += 1;
        harness.store.tamper_allocation(middle.clone()).await;

        let (status, json) = get_json(&harness.router, "/api/v1/ledger/verify").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["result"], "broken");
        assert_eq!(json["allocation_id"], middle.id.to_string());
        assert_eq!(json["reason"], "hash_mismatch");
    }

    #[tokio::test]
    async fn test_ledger_verification_detects_redirected_payout() {
        let harness = HarnessBuilder::new().build();
        for i in 0..2 {
            post_signed(&harness.router, &payment_event(&format!("pay_chain_{i}"), 1000 + i, "COMPLETED")).await;
        }

        let mut first = harness.store.list_chain().await.unwrap()[0].clone();
        first.shares[0].account_ref = "acct_elsewhere".to_string();
        harness.store.tamper_allocation(first.clone()).await;

        let (status, json) = get_json(&harness.router, "/api/v1/ledger/verify").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["result"], "broken");
        assert_eq!(json["allocation_id"], first.id.to_string());
        assert_eq!(json["reason"], "hash_mismatch");
    }

    #[tokio::test]
    async fn test_ledger_verification_detects_dropped_tail() {
        let harness = HarnessBuilder::new().build();
        for i in 0..3 {
            post_signed(&harness.router, &payment_event(&format!("pay_chain_{i}"), 1000 + i, "COMPLETED")).await;
        }

        let mut newest = harness.store.list_chain().await.unwrap()[2].clone();
        newest.status = AllocationStatus::Failed;
        harness.store.tamper_allocation(newest).await;

        let (status, json) = get_json(&harness.router, "/api/v1/ledger/verify").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["result"], "truncated");
        assert_eq!(json["length"], 2);
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let harness = HarnessBuilder::new().build();

        let (status, json) = get_json(&harness.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");

        let (status, json) = get_json(&harness.router, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ready");

        let unconfigured = HarnessBuilder::new().secret(None).build();
        let (status, json) = get_json(&unconfigured.router, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["webhook_secret"]["status"], "unhealthy");
    }
}
