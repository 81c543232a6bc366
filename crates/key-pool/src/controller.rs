//! Quota-aware retry loop around one OCR call
//!
//! Per-call state machine:
//!
//! ```text
//! SELECTING ──exhausted──────────────────────────▶ PoolExhausted
//!     │
//!     ▼
//! CALLING ──ok──▶ commit usage (best-effort) ────▶ text
//!     │
//!     ├──quota exceeded──▶ exclude key, SELECTING
//!     └──other error─────────────────────────────▶ Provider
//! ```
//!
//! Cancellation is checked at every suspension point and ends the call
//! without committing usage. There is no sleep between attempts: a quota
//! rejection is final for that key, so the next key is tried at once.

use std::collections::HashSet;
use std::sync::Arc;

use ocr_provider::{ImagePayload, OcrClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::recorder::UsageRecorder;
use crate::selection::SelectionPolicy;

/// Orchestrates one logical OCR call across the key pool.
///
/// Holds no per-call state; one instance serves every request.
pub struct QuotaRetryController {
    policy: Arc<dyn SelectionPolicy>,
    client: Arc<dyn OcrClient>,
    recorder: Option<UsageRecorder>,
}

impl QuotaRetryController {
    pub fn new(policy: Arc<dyn SelectionPolicy>, client: Arc<dyn OcrClient>) -> Self {
        Self {
            policy,
            client,
            recorder: None,
        }
    }

    /// Charge successful calls through `recorder`. Without one (ephemeral
    /// pools) nothing is accounted.
    pub fn with_recorder(mut self, recorder: UsageRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn policy(&self) -> &Arc<dyn SelectionPolicy> {
        &self.policy
    }

    /// Recognize `image`, rotating keys on quota rejection.
    ///
    /// Returns exactly one of: the provider's text, `PoolExhausted`,
    /// `Provider`, `Store` or `Cancelled`. Attempts are bounded by the pool
    /// size since every rejected key joins the exclusion set.
    #[instrument(skip_all, fields(policy = self.policy.name(), client = self.client.id()))]
    pub async fn execute(&self, image: &ImagePayload, cancel: &CancellationToken) -> Result<String> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempt = 0usize;

        loop {
            let selected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(attempt)),
                selected = self.policy.next(&excluded) => selected,
            };
            let key = match selected {
                Ok(key) => key,
                Err(Error::PoolExhausted(msg)) => {
                    metrics::counter!("ocr_pool_exhausted_total").increment(1);
                    warn!(attempts = attempt, rejected = excluded.len(), reason = %msg, "key pool exhausted");
                    return Err(Error::PoolExhausted(msg));
                }
                Err(other) => return Err(other),
            };
            if excluded.contains(&key.id) {
                metrics::counter!("ocr_pool_exhausted_total").increment(1);
                warn!(key_id = %key.id, "policy returned an already rejected key");
                return Err(Error::PoolExhausted(format!(
                    "no untried key left after {} quota rejections",
                    excluded.len()
                )));
            }

            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(attempt)),
                outcome = self.client.recognize(&key, image) => outcome,
            };

            match outcome {
                Ok(text) => {
                    metrics::counter!("ocr_key_attempts_total", "outcome" => "success").increment(1);
                    info!(key_id = %key.id, attempt, chars = text.len(), "ocr call succeeded");
                    self.commit(&key.id).await;
                    return Ok(text);
                }
                Err(e) if e.is_quota_exceeded() => {
                    metrics::counter!("ocr_key_attempts_total", "outcome" => "quota_exceeded")
                        .increment(1);
                    info!(key_id = %key.id, attempt, error = %e, "key rejected for quota, rotating");
                    excluded.insert(key.id);
                }
                Err(e) => {
                    metrics::counter!("ocr_key_attempts_total", "outcome" => e.classification().label())
                        .increment(1);
                    warn!(key_id = %key.id, attempt, error = %e, "ocr call failed");
                    return Err(Error::Provider(e));
                }
            }
        }
    }

    /// Best-effort usage commit. The text is already obtained, so a failure
    /// here is only logged.
    async fn commit(&self, key_id: &str) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        if let Err(e) = recorder.commit(key_id).await {
            metrics::counter!("ocr_usage_commit_failures_total").increment(1);
            warn!(key_id, error = %e, "usage commit failed, returning text anyway");
        }
    }
}

fn cancelled(attempt: usize) -> Error {
    info!(attempt, "ocr call cancelled");
    Error::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{LeastUsedWithExpiry, RoundRobin};
    use chrono::{Duration, Utc};
    use key_store::{Credential, CredentialStore, FileCredentialStore};
    use ocr_provider::{ApiKey, CallError};
    use std::collections::{BTreeMap, HashMap};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// OCR client that answers per key id and records the ids it was called with.
    struct ScriptedClient {
        responses: HashMap<String, std::result::Result<String, CallError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: &[(&str, std::result::Result<&str, CallError>)]) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .iter()
                    .map(|(id, r)| (id.to_string(), r.clone().map(str::to_string)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl OcrClient for ScriptedClient {
        fn id(&self) -> &str {
            "scripted"
        }

        fn recognize<'a>(
            &'a self,
            key: &'a ApiKey,
            _image: &'a ImagePayload,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<String, CallError>> + Send + 'a>>
        {
            self.calls.lock().unwrap().push(key.id.clone());
            let response = self
                .responses
                .get(&key.id)
                .cloned()
                .unwrap_or_else(|| Err(CallError::Malformed(format!("unscripted key {}", key.id))));
            Box::pin(async move { response })
        }
    }

    /// OCR client that never answers, standing in for a slow provider.
    struct HangingClient {
        calls: Mutex<usize>,
    }

    impl OcrClient for HangingClient {
        fn id(&self) -> &str {
            "hanging"
        }

        fn recognize<'a>(
            &'a self,
            _key: &'a ApiKey,
            _image: &'a ImagePayload,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<String, CallError>> + Send + 'a>>
        {
            *self.calls.lock().unwrap() += 1;
            Box::pin(std::future::pending())
        }
    }

    fn quota() -> CallError {
        CallError::QuotaExceeded("You may only perform this action upto maximum 500 number of times within 86400 seconds".into())
    }

    fn image() -> ImagePayload {
        ImagePayload::new(b"\xff\xd8\xff".to_vec(), "image/jpeg")
    }

    fn ring(n: usize) -> Vec<ApiKey> {
        (0..n)
            .map(|i| ApiKey::new(format!("key-{i}"), format!("secret-value-{i}")))
            .collect()
    }

    fn record(balance: u64, usage_count: u64) -> Credential {
        Credential {
            id: String::new(),
            key: "K81234567890ABCD".into(),
            balance,
            usage_count,
            created_at: Utc::now() - Duration::days(1),
            expires_at: Some(Utc::now() + Duration::days(30)),
            endpoint: None,
        }
    }

    async fn durable_store(
        dir: &tempfile::TempDir,
        records: &[(&str, Credential)],
    ) -> Arc<FileCredentialStore> {
        let path = dir.path().join("keys.json");
        let map: BTreeMap<String, Credential> = records
            .iter()
            .map(|(id, c)| (id.to_string(), c.clone()))
            .collect();
        tokio::fs::write(&path, serde_json::to_string(&map).unwrap())
            .await
            .unwrap();
        Arc::new(FileCredentialStore::load(path).await.unwrap())
    }

    fn durable_controller(
        store: Arc<FileCredentialStore>,
        client: Arc<dyn OcrClient>,
    ) -> QuotaRetryController {
        QuotaRetryController::new(Arc::new(LeastUsedWithExpiry::new(store.clone())), client)
            .with_recorder(UsageRecorder::new(store))
    }

    #[tokio::test]
    async fn all_ineligible_exhausts_without_calling_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable_store(&dir, &[("k1", record(0, 3)), ("k2", record(0, 9))]).await;
        let client = ScriptedClient::new(&[]);
        let controller = durable_controller(store, client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)), "got: {err:?}");
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_ring_exhausts_without_calling_provider() {
        let client = ScriptedClient::new(&[]);
        let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(vec![])), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn single_usable_key_found_from_every_cursor() {
        for initial in 0..4 {
            let client = ScriptedClient::new(&[
                ("key-0", Err(quota())),
                ("key-1", Err(quota())),
                ("key-2", Ok("IDENTITY CARD 880101-14-5566")),
                ("key-3", Err(quota())),
            ]);
            let controller = QuotaRetryController::new(
                Arc::new(RoundRobin::with_cursor(ring(4), initial)),
                client.clone(),
            );

            let text = controller
                .execute(&image(), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(text, "IDENTITY CARD 880101-14-5566", "initial cursor {initial}");
            assert!(client.calls().len() <= 4);
            assert_eq!(client.calls().last().unwrap(), "key-2");
        }
    }

    #[tokio::test]
    async fn every_key_quota_rejected_exhausts_after_n_attempts() {
        let client = ScriptedClient::new(&[
            ("key-0", Err(quota())),
            ("key-1", Err(quota())),
            ("key-2", Err(quota())),
        ]);
        let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(ring(3))), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)), "got: {err:?}");
        assert_eq!(client.calls(), vec!["key-0", "key-1", "key-2"]);
    }

    #[tokio::test]
    async fn cursor_persists_across_calls() {
        let client = ScriptedClient::new(&[
            ("key-0", Ok("zero")),
            ("key-1", Ok("one")),
            ("key-2", Ok("two")),
        ]);
        let ring = Arc::new(RoundRobin::new(ring(3)));
        let controller = QuotaRetryController::new(ring.clone(), client.clone());

        let mut texts = vec![];
        for _ in 0..4 {
            texts.push(
                controller
                    .execute(&image(), &CancellationToken::new())
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(texts, vec!["zero", "one", "two", "zero"]);
        assert_eq!(ring.cursor(), 1);
    }

    #[tokio::test]
    async fn quota_then_success_charges_only_the_successful_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = record(7, 2);
        a.expires_at = Some(Utc::now() + Duration::days(1));
        let b = record(7, 2);
        let store = durable_store(&dir, &[("A", a), ("B", b)]).await;
        let client = ScriptedClient::new(&[("A", Err(quota())), ("B", Ok("text from B"))]);
        let controller = durable_controller(store.clone(), client.clone());

        let text = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "text from B");
        assert_eq!(client.calls(), vec!["A", "B"]);

        let a = store.get("A").await.unwrap();
        assert_eq!((a.balance, a.usage_count), (7, 2));
        let b = store.get("B").await.unwrap();
        assert_eq!((b.balance, b.usage_count), (6, 3));
    }

    #[tokio::test]
    async fn depleted_key_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut k1 = record(0, 0);
        k1.expires_at = Some(Utc::now() + Duration::days(1));
        let store = durable_store(&dir, &[("K1", k1), ("K2", record(5, 0))]).await;
        let client = ScriptedClient::new(&[("K1", Ok("wrong key")), ("K2", Ok("NRIC 900101-10-1234"))]);
        let controller = durable_controller(store.clone(), client.clone());

        let text = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "NRIC 900101-10-1234");
        assert_eq!(client.calls(), vec!["K2"]);

        let k2 = store.get("K2").await.unwrap();
        assert_eq!(k2.balance, 4);
        assert_eq!(k2.usage_count, 1);
    }

    #[tokio::test]
    async fn lone_key_rejected_for_quota_exhausts_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable_store(&dir, &[("K1", record(1, 0))]).await;
        let client = ScriptedClient::new(&[("K1", Err(quota()))]);
        let controller = durable_controller(store.clone(), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)), "got: {err:?}");
        assert_eq!(client.calls(), vec!["K1"]);

        let k1 = store.get("K1").await.unwrap();
        assert_eq!((k1.balance, k1.usage_count), (1, 0));
    }

    #[tokio::test]
    async fn cancellation_mid_call_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable_store(&dir, &[("K1", record(3, 0))]).await;
        let client = Arc::new(HangingClient {
            calls: Mutex::new(0),
        });
        let controller = durable_controller(store.clone(), client.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = controller.execute(&image(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got: {err:?}");
        assert_eq!(*client.calls.lock().unwrap(), 1);

        let k1 = store.get("K1").await.unwrap();
        assert_eq!((k1.balance, k1.usage_count), (3, 0));
    }

    #[tokio::test]
    async fn already_cancelled_token_makes_no_call() {
        let client = ScriptedClient::new(&[("key-0", Ok("text"))]);
        let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(ring(1))), client.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller.execute(&image(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn non_quota_error_is_fatal_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = durable_store(&dir, &[("K1", record(3, 0)), ("K2", record(3, 5))]).await;
        let client = ScriptedClient::new(&[
            ("K1", Err(CallError::Auth("The API key is invalid".into()))),
            ("K2", Ok("never reached")),
        ]);
        let controller = durable_controller(store.clone(), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Provider(CallError::Auth(msg)) => assert!(msg.contains("invalid")),
            other => panic!("expected provider auth error, got {other:?}"),
        }
        assert_eq!(client.calls(), vec!["K1"]);
        assert_eq!(store.get("K1").await.unwrap().balance, 3);
    }

    #[tokio::test]
    async fn transport_error_is_fatal() {
        let client = ScriptedClient::new(&[
            ("key-0", Err(CallError::Transport("connection reset".into()))),
            ("key-1", Ok("never reached")),
        ]);
        let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(ring(2))), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(CallError::Transport(_))));
        assert_eq!(client.calls(), vec!["key-0"]);
    }

    /// Store that always hands out the same key but refuses every charge.
    struct RefusingStore;

    impl CredentialStore for RefusingStore {
        fn fetch_eligible<'a>(
            &'a self,
            _excluded: &'a HashSet<String>,
        ) -> Pin<Box<dyn Future<Output = key_store::Result<Credential>> + Send + 'a>> {
            Box::pin(async {
                let mut credential = record(1, 0);
                credential.id = "K1".into();
                Ok(credential)
            })
        }

        fn apply_usage_delta<'a>(
            &'a self,
            id: &'a str,
            _balance_delta: i64,
            _usage_delta: u64,
        ) -> Pin<Box<dyn Future<Output = key_store::Result<Credential>> + Send + 'a>> {
            Box::pin(async move { Err(key_store::Error::Conflict(format!("{id} raced to zero"))) })
        }

        fn snapshot(&self) -> Pin<Box<dyn Future<Output = Vec<Credential>> + Send + '_>> {
            Box::pin(async { Vec::new() })
        }
    }

    #[tokio::test]
    async fn commit_failure_still_returns_text() {
        let store: Arc<dyn CredentialStore> = Arc::new(RefusingStore);
        let client = ScriptedClient::new(&[("K1", Ok("PASSPORT A12345678"))]);
        let controller = QuotaRetryController::new(
            Arc::new(LeastUsedWithExpiry::new(store.clone())),
            client.clone(),
        )
        .with_recorder(UsageRecorder::new(store));

        let text = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "PASSPORT A12345678");
    }

    #[tokio::test]
    async fn policy_repeating_a_rejected_key_ends_as_exhausted() {
        // RefusingStore ignores exclusions, so K1 comes back after its rejection
        let store: Arc<dyn CredentialStore> = Arc::new(RefusingStore);
        let client = ScriptedClient::new(&[("K1", Err(quota()))]);
        let controller =
            QuotaRetryController::new(Arc::new(LeastUsedWithExpiry::new(store)), client.clone());

        let err = controller
            .execute(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert_eq!(client.calls(), vec!["K1"]);
    }

    #[tokio::test]
    async fn ephemeral_pool_forgets_rejections_between_calls() {
        let client = ScriptedClient::new(&[("key-0", Err(quota())), ("key-1", Ok("ok"))]);
        let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(ring(2))), client.clone());

        controller.execute(&image(), &CancellationToken::new()).await.unwrap();
        // Two advances per call bring the cursor back to key-0, which is tried again
        controller.execute(&image(), &CancellationToken::new()).await.unwrap();
        assert_eq!(client.calls(), vec!["key-0", "key-1", "key-0", "key-1"]);
    }

    #[test]
    fn attempts_are_counted_by_outcome() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let client = ScriptedClient::new(&[("key-0", Err(quota())), ("key-1", Ok("ok"))]);
            let controller = QuotaRetryController::new(Arc::new(RoundRobin::new(ring(2))), client);
            controller.execute(&image(), &CancellationToken::new()).await.unwrap();
        });

        let output = handle.render();
        assert!(output.contains("ocr_key_attempts_total"), "got: {output}");
        assert!(output.contains("outcome=\"quota_exceeded\""), "got: {output}");
        assert!(output.contains("outcome=\"success\""), "got: {output}");
    }
}
