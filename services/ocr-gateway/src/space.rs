//! OCR.space client
//!
//! Posts the image as a `base64Image` form field with the key in the `apikey`
//! header, then turns the provider's answer into text or a tagged
//! `CallError`. OCR.space reports most failures inside a 200 body
//! (`IsErroredOnProcessing`), and exhausted daily allowances as 403 with a
//! plain-text message, so both the status and the message text are checked.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use key_pool::{classify_message, classify_status};
use ocr_provider::{ApiKey, CallError, ErrorClassification, ImagePayload, OcrClient};
use serde::Deserialize;
use tracing::debug;

/// Upper bound on provider error text carried into `CallError`.
const MAX_ERROR_BODY: usize = 512;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider response body. Only the fields the gateway reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParseResponse {
    #[serde(default)]
    parsed_results: Option<Vec<ParsedResult>>,
    #[serde(default)]
    is_errored_on_processing: bool,
    /// A string or a list of strings depending on the failure
    #[serde(default)]
    error_message: Option<serde_json::Value>,
    #[serde(default)]
    error_details: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParsedResult {
    #[serde(default)]
    parsed_text: String,
}

/// HTTP client for the OCR.space parse endpoint.
pub struct SpaceOcrClient {
    http: reqwest::Client,
    default_endpoint: String,
    language: String,
    engine: u8,
}

impl SpaceOcrClient {
    pub fn new(
        http: reqwest::Client,
        default_endpoint: impl Into<String>,
        language: impl Into<String>,
        engine: u8,
    ) -> Self {
        Self {
            http,
            default_endpoint: default_endpoint.into(),
            language: language.into(),
            engine,
        }
    }

    /// Build the shared reqwest client.
    ///
    /// Only connecting is bounded here. The whole call runs under the
    /// request deadline, which cancels it and answers 504.
    pub fn http_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
    }

    fn endpoint_for<'a>(&'a self, key: &'a ApiKey) -> &'a str {
        key.endpoint.as_deref().unwrap_or(&self.default_endpoint)
    }
}

impl OcrClient for SpaceOcrClient {
    fn id(&self) -> &str {
        "ocr.space"
    }

    fn recognize<'a>(
        &'a self,
        key: &'a ApiKey,
        image: &'a ImagePayload,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let endpoint = self.endpoint_for(key);
            let engine = self.engine.to_string();
            let form = [
                ("base64Image", image.to_data_url()),
                ("language", self.language.clone()),
                ("OCREngine", engine),
            ];

            debug!(key_id = %key.id, endpoint, bytes = image.len(), "calling OCR.space");
            let response = self
                .http
                .post(endpoint)
                .header("apikey", key.secret.expose())
                .form(&form)
                .send()
                .await
                .map_err(|e| CallError::Transport(e.without_url().to_string()))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| CallError::Transport(e.without_url().to_string()))?;

            parse_response(status, &body)
        })
    }
}

/// Classify one provider answer.
pub fn parse_response(status: u16, body: &str) -> Result<String, CallError> {
    if !(200..300).contains(&status) {
        let message = format!("HTTP {status}: {}", truncate(body.trim()));
        return Err(match classify_status(status, body) {
            ErrorClassification::QuotaExceeded => CallError::QuotaExceeded(message),
            ErrorClassification::Permanent => CallError::Auth(message),
            ErrorClassification::Transient if status >= 500 || status == 408 => {
                CallError::Transport(message)
            }
            ErrorClassification::Transient => CallError::Malformed(message),
        });
    }

    let parsed: ParseResponse = serde_json::from_str(body).map_err(|e| {
        // Quota notices sometimes arrive as a bare string with a 200
        match classify_message(body) {
            ErrorClassification::QuotaExceeded => CallError::QuotaExceeded(truncate(body.trim())),
            _ => CallError::Malformed(format!("unparseable response: {e}")),
        }
    })?;

    if parsed.is_errored_on_processing {
        let message = error_text(&parsed);
        return Err(match classify_message(&message) {
            ErrorClassification::QuotaExceeded => CallError::QuotaExceeded(message),
            _ => CallError::Malformed(message),
        });
    }

    let results = parsed.parsed_results.unwrap_or_default();
    if results.is_empty() {
        return Err(CallError::Malformed("no text found in image".into()));
    }
    Ok(results.into_iter().map(|r| r.parsed_text).collect())
}

fn error_text(parsed: &ParseResponse) -> String {
    let mut parts: Vec<String> = match &parsed.error_message {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    if let Some(details) = parsed.error_details.as_deref().filter(|d| !d.is_empty()) {
        parts.push(details.to_string());
    }
    if parts.is_empty() {
        return "processing failed without an error message".into();
    }
    truncate(&parts.join("; "))
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
