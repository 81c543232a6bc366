//! Downstream OCR provider boundary
//!
//! Defines the `OcrClient` trait that decouples key rotation from the concrete
//! OCR service. Implementations report failures through the tagged
//! `CallError`, so the retry controller never inspects provider wording:
//! - `QuotaExceeded` rotates to the next key
//! - everything else aborts the call

pub mod image;

pub use image::{ImageError, ImagePayload};

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Classification of downstream errors to determine the rotation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// The presented key has no allowance left, try the next key
    QuotaExceeded,
    /// Invalid or revoked key (401/403 without a quota message)
    Permanent,
    /// Network fault, timeout, 5xx or malformed response
    Transient,
}

impl ErrorClassification {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Permanent => "permanent",
            ErrorClassification::Transient => "transient",
        }
    }
}

/// Failure of a single downstream OCR call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl CallError {
    pub fn classification(&self) -> ErrorClassification {
        match self {
            CallError::QuotaExceeded(_) => ErrorClassification::QuotaExceeded,
            CallError::Auth(_) => ErrorClassification::Permanent,
            CallError::Transport(_) | CallError::Malformed(_) => ErrorClassification::Transient,
        }
    }

    /// Only quota rejections are retried, on a different key.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CallError::QuotaExceeded(_))
    }
}

/// A key selected for one downstream call.
///
/// `id` identifies the credential record (never the secret itself) and is what
/// appears in logs, exclusion sets and usage commits.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub secret: Secret<String>,
    /// Provider endpoint bound to this key, if any
    pub endpoint: Option<String>,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: Secret::new(secret.into()),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Abstraction over the OCR service that turns an image into text.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn OcrClient>`).
/// Callers cancel a call by dropping the returned future.
pub trait OcrClient: Send + Sync {
    /// Identifier for logging (e.g. "ocr-space")
    fn id(&self) -> &str;

    /// Run text recognition on `image`, authenticating with `key`.
    fn recognize<'a>(
        &'a self,
        key: &'a ApiKey,
        image: &'a ImagePayload,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_quota_errors_are_retryable() {
        assert!(CallError::QuotaExceeded("daily limit".into()).is_quota_exceeded());
        assert!(!CallError::Auth("bad key".into()).is_quota_exceeded());
        assert!(!CallError::Transport("connection reset".into()).is_quota_exceeded());
        assert!(!CallError::Malformed("no ParsedResults".into()).is_quota_exceeded());
    }

    #[test]
    fn classification_maps_variants() {
        assert_eq!(
            CallError::QuotaExceeded(String::new()).classification(),
            ErrorClassification::QuotaExceeded
        );
        assert_eq!(
            CallError::Auth(String::new()).classification(),
            ErrorClassification::Permanent
        );
        assert_eq!(
            CallError::Transport(String::new()).classification(),
            ErrorClassification::Transient
        );
        assert_eq!(
            CallError::Malformed(String::new()).classification(),
            ErrorClassification::Transient
        );
    }

    #[test]
    fn api_key_debug_hides_secret() {
        let key = ApiKey::new("key-0", "K81234567890ABCD").with_endpoint("https://ocr.example");
        let debug = format!("{key:?}");
        assert!(debug.contains("key-0"));
        assert!(debug.contains("https://ocr.example"));
        assert!(!debug.contains("K81234567890ABCD"), "got: {debug}");
    }

    struct EchoClient;

    impl OcrClient for EchoClient {
        fn id(&self) -> &str {
            "echo"
        }

        fn recognize<'a>(
            &'a self,
            key: &'a ApiKey,
            image: &'a ImagePayload,
        ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
            Box::pin(async move { Ok(format!("{}:{}", key.id, image.len())) })
        }
    }

    #[tokio::test]
    async fn trait_is_dyn_compatible() {
        let client: std::sync::Arc<dyn OcrClient> = std::sync::Arc::new(EchoClient);
        let key = ApiKey::new("key-1", "secret-value");
        let image = ImagePayload::new(vec![1, 2, 3], "image/png");
        assert_eq!(client.id(), "echo");
        assert_eq!(client.recognize(&key, &image).await.unwrap(), "key-1:3");
    }
}
