//! Usage accounting after a successful call

use std::sync::Arc;

use key_store::{Credential, CredentialStore};
use tracing::debug;

use crate::error::{Error, Result};

/// Charges one call against a key in the durable store.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn CredentialStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Decrement balance by one and increment usage by one, atomically.
    ///
    /// A key whose balance already reached zero (another caller charged it
    /// first) yields `Accounting`, as does any store failure.
    pub async fn commit(&self, key_id: &str) -> Result<Credential> {
        let updated = self
            .store
            .apply_usage_delta(key_id, -1, 1)
            .await
            .map_err(|e| Error::Accounting(format!("key {key_id}: {e}")))?;
        debug!(
            key_id,
            balance = updated.balance,
            usage_count = updated.usage_count,
            "usage committed"
        );
        Ok(updated)
    }
}
