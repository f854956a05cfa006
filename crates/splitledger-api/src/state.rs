//! Application state shared across handlers

use std::sync::Arc;

use splitledger_allocation::AllocationEngine;
use splitledger_crypto::WebhookVerifier;
use splitledger_db::{IdempotencyGuard, LedgerStore};

use crate::DEFAULT_SIGNATURE_HEADER;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Transaction and allocation storage
    pub store: Arc<dyn LedgerStore>,
    /// Processed-payment window
    pub idempotency: IdempotencyGuard,
    /// Webhook signature check
    pub verifier: WebhookVerifier,
    pub engine: Arc<AllocationEngine>,
    /// Lowercase name of the header carrying the signature
    pub signature_header: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        idempotency: IdempotencyGuard,
        verifier: WebhookVerifier,
        engine: Arc<AllocationEngine>,
    ) -> Self {
        Self {
            store,
            idempotency,
            verifier,
            engine,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        }
    }

    pub fn with_signature_header(mut self, header: &str) -> Self {
        self.signature_header = header.trim().to_ascii_lowercase();
        self
    }
}
