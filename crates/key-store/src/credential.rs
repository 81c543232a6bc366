//! Credential record

use chrono::{DateTime, Utc};
use ocr_provider::ApiKey;
use serde::{Deserialize, Serialize};

/// One provisioned OCR API key and its accounting state.
///
/// Serialized as `{key, balance, usageCount, createdAt, expiresAt, endpoint}`;
/// the id is the key of the enclosing JSON object.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(skip)]
    pub id: String,
    pub key: String,
    /// Remaining permitted calls
    pub balance: u64,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider endpoint this key is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Positive balance and not expired.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.balance > 0 && !self.is_expired(now)
    }

    /// The view handed to the OCR client.
    pub fn api_key(&self) -> ApiKey {
        let key = ApiKey::new(self.id.clone(), self.key.clone());
        match &self.endpoint {
            Some(endpoint) => key.with_endpoint(endpoint.clone()),
            None => key,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .field("balance", &self.balance)
            .field("usage_count", &self.usage_count)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
