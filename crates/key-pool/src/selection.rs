//! Key selection policies
//!
//! A policy hands out the next key to try, given the ids already tried during
//! the current call. Both policies are owned by one handle
//! (`Arc<dyn SelectionPolicy>`) shared by every request, so their state
//! (the round-robin cursor, the store) lives for the whole process.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use key_store::CredentialStore;
use ocr_provider::ApiKey;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Strategy that picks the next candidate key.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility.
pub trait SelectionPolicy: Send + Sync {
    /// Strategy label for logging and health reporting
    fn name(&self) -> &str;

    /// Next key whose id is not in `excluded`, or `PoolExhausted`.
    fn next<'a>(
        &'a self,
        excluded: &'a HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ApiKey>> + Send + 'a>>;

    /// Pool health summary for the health endpoint.
    fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>>;
}

/// Round-robin over a fixed in-process key list.
///
/// The cursor advances by one on every `next` call whatever the outcome, so
/// load spreads even across failing keys. The scan for a non-excluded key
/// starts at the cursor position. No accounting is kept.
pub struct RoundRobin {
    keys: Vec<ApiKey>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self::with_cursor(keys, 0)
    }

    /// Start the rotation at `initial` (taken modulo the pool size).
    pub fn with_cursor(keys: Vec<ApiKey>, initial: usize) -> Self {
        let start = if keys.is_empty() { 0 } else { initial % keys.len() };
        info!(keys = keys.len(), cursor = start, "round-robin pool initialized");
        Self {
            keys,
            cursor: AtomicUsize::new(start),
        }
    }

    /// Current cursor position, always `< len()` for a non-empty pool.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Synchronous core of `next`.
    pub fn select(&self, excluded: &HashSet<String>) -> Result<ApiKey> {
        let n = self.keys.len();
        if n == 0 {
            return Err(Error::PoolExhausted("no API keys configured".into()));
        }

        let start = self.advance(n);
        for offset in 0..n {
            let key = &self.keys[(start + offset) % n];
            if !excluded.contains(&key.id) {
                debug!(key_id = %key.id, cursor = start, "round-robin selected key");
                return Ok(key.clone());
            }
        }

        Err(Error::PoolExhausted(format!(
            "all {n} API keys rejected for quota"
        )))
    }

    /// Move the cursor one step and return its previous position.
    fn advance(&self, n: usize) -> usize {
        // The closure never returns None, so both arms carry the previous value.
        self.cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some((c + 1) % n))
            .unwrap_or_else(|c| c)
    }
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn next<'a>(
        &'a self,
        excluded: &'a HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ApiKey>> + Send + 'a>> {
        Box::pin(async move { self.select(excluded) })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>> {
        Box::pin(async move {
            let status = if self.keys.is_empty() {
                "unhealthy"
            } else {
                "healthy"
            };
            let keys: Vec<serde_json::Value> = self
                .keys
                .iter()
                .map(|k| serde_json::json!({ "id": k.id, "fingerprint": k.secret.fingerprint() }))
                .collect();
            serde_json::json!({
                "strategy": self.name(),
                "status": status,
                "keys_total": self.keys.len(),
                "cursor": self.cursor(),
                "keys": keys
            })
        })
    }
}

/// Durable selection: the soonest-expiring eligible key, least used first.
///
/// Delegates to `CredentialStore::fetch_eligible`; a store with nothing
/// eligible means the pool is exhausted.
pub struct LeastUsedWithExpiry {
    store: Arc<dyn CredentialStore>,
}

impl LeastUsedWithExpiry {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}

impl SelectionPolicy for LeastUsedWithExpiry {
    fn name(&self) -> &str {
        "least_used"
    }

    fn next<'a>(
        &'a self,
        excluded: &'a HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ApiKey>> + Send + 'a>> {
        Box::pin(async move {
            match self.store.fetch_eligible(excluded).await {
                Ok(credential) => {
                    debug!(
                        key_id = %credential.id,
                        balance = credential.balance,
                        usage_count = credential.usage_count,
                        "least-used selected key"
                    );
                    Ok(credential.api_key())
                }
                Err(key_store::Error::NotFound(msg)) => Err(Error::PoolExhausted(msg)),
                Err(other) => Err(Error::Store(other.to_string())),
            }
        })
    }

    /// Status mapping: all keys eligible → healthy, some eligible → degraded,
    /// none eligible (or no keys) → unhealthy.
    fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>> {
        Box::pin(async move {
            let now = Utc::now();
            let records = self.store.snapshot().await;

            let mut keys = Vec::new();
            let mut eligible = 0usize;
            let mut depleted = 0usize;
            let mut expired = 0usize;

            for credential in &records {
                let status = if credential.is_expired(now) {
                    expired += 1;
                    "expired"
                } else if credential.balance == 0 {
                    depleted += 1;
                    "depleted"
                } else {
                    eligible += 1;
                    "eligible"
                };
                keys.push(serde_json::json!({
                    "id": credential.id,
                    "status": status,
                    "balance": credential.balance,
                    "usage_count": credential.usage_count,
                    "expires_at": credential.expires_at.map(|t| t.to_rfc3339()),
                }));
            }

            let total = records.len();
            let status = if eligible == total && total > 0 {
                "healthy"
            } else if eligible > 0 {
                "degraded"
            } else {
                "unhealthy"
            };

            serde_json::json!({
                "strategy": self.name(),
                "status": status,
                "keys_total": total,
                "keys_eligible": eligible,
                "keys_depleted": depleted,
                "keys_expired": expired,
                "keys": keys
            })
        })
    }
}
