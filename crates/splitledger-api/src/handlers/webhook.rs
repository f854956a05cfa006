//! Payment webhook ingress
//!
//! Order matters: the signature is checked over the raw body before
//! anything is parsed, and the idempotency window is only marked once the
//! transaction and its allocation are durably recorded.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

use splitledger_db::{AllocationStore, DbError, TransactionStore};
use splitledger_types::{timestamp_now, LedgerEvent, PaymentEvent, ProfitAllocation, Transaction};

use crate::dto::{WebhookResponse, WebhookStatus};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn record_outcome(outcome: &'static str) {
    counter!("splitledger_webhooks_total", "outcome" => outcome).increment(1);
}

fn respond(response: WebhookResponse) -> ApiResult<Json<WebhookResponse>> {
    record_outcome(response.status.as_str());
    Ok(Json(response))
}

/// `POST /webhooks/payments`
pub async fn receive_payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());

    if let Err(e) = state.verifier.check(&body, signature) {
        let err = ApiError::from(e);
        match &err {
            ApiError::WebhookSecretMissing => {
                record_outcome("misconfigured");
                warn!("Webhook rejected: signing secret not configured");
            }
            _ => {
                record_outcome("forbidden");
                warn!(error = %err, "Webhook rejected: signature check failed");
            }
        }
        return Err(err);
    }

    let event: PaymentEvent = serde_json::from_slice(&body).map_err(|e| {
        record_outcome("invalid");
        ApiError::InvalidPayload(e.to_string())
    })?;

    if !event.is_payment_event() {
        debug!(event_type = %event.event_type, "Ignoring non-payment event");
        return respond(WebhookResponse::status(WebhookStatus::Ignored));
    }

    let Some(payment) = event.payment() else {
        record_outcome("invalid");
        return Err(ApiError::InvalidPayload("payment object missing".to_string()));
    };

    if !payment.is_completed() {
        debug!(payment_id = %payment.id, status = %payment.status, "Payment not completed yet");
        return respond(WebhookResponse::status(WebhookStatus::Pending));
    }

    let payment_id = payment.id.clone();

    if state.idempotency.has_been_processed(&payment_id).await? {
        debug!(payment_id = %payment_id, "Payment inside idempotency window");
        return respond(already_processed(&state, &payment_id).await?);
    }

    let input = event.to_new_transaction().map_err(|e| {
        record_outcome("invalid");
        ApiError::from(e)
    })?;

    let transaction = match state.store.create(input).await {
        Ok(transaction) => transaction,
        Err(DbError::DuplicateTransaction { .. }) => {
            info!(payment_id = %payment_id, "Duplicate payment delivery");
            let response = already_processed(&state, &payment_id).await?;
            state.idempotency.mark_processed(&payment_id).await?;
            return respond(response);
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        transaction_id = %transaction.id,
        payment_id = %payment_id,
        amount_minor = transaction.amount_minor,
        currency = %transaction.currency,
        source = %transaction.source,
        "Payment recorded"
    );
    state.engine.emit(transaction_created(&transaction));

    let allocation = state.engine.run(&transaction).await?;
    state.idempotency.mark_processed(&payment_id).await?;

    respond(WebhookResponse::with_allocation(WebhookStatus::Processed, &allocation))
}

/// Acknowledgement for a payment that already has a transaction.
///
/// Carries the existing allocation when there is one. A transaction whose
/// allocation was never created (crash right after recording) is allocated
/// now.
async fn already_processed(state: &AppState, payment_id: &str) -> ApiResult<WebhookResponse> {
    let Some(transaction) = state.store.find_by_external_id(payment_id).await? else {
        return Ok(WebhookResponse::status(WebhookStatus::AlreadyProcessed));
    };

    let allocation: ProfitAllocation = match state
        .store
        .find_allocation_by_transaction(&transaction.id)
        .await?
    {
        Some(allocation) => allocation,
        None => state.engine.run(&transaction).await?,
    };

    Ok(WebhookResponse::with_allocation(
        WebhookStatus::AlreadyProcessed,
        &allocation,
    ))
}

fn transaction_created(transaction: &Transaction) -> LedgerEvent {
    LedgerEvent::TransactionCreated {
        transaction_id: transaction.id,
        external_payment_id: transaction.external_payment_id.clone(),
        amount_minor: transaction.amount_minor,
        currency: transaction.currency.code().to_string(),
        source: transaction.source,
        timestamp: timestamp_now(),
    }
}
