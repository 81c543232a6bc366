//! `POST /ocr` handler
//!
//! Decodes the image, runs one rotation call under the request deadline and
//! maps the outcome to JSON. The deadline cancels the call through a
//! `CancellationToken`, so a provider answer that already arrived is still
//! charged before the timeout response goes out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::QuotaRetryController;
use ocr_provider::ImagePayload;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::ApiError;
use crate::metrics;

/// Request counters reported on `/health`
#[derive(Debug, Clone)]
pub struct GatewayStats {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `in_flight` when the request finishes or is dropped.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared state for the OCR route
#[derive(Clone)]
pub struct OcrState {
    pub controller: Arc<QuotaRetryController>,
    pub timeout: Duration,
    pub stats: GatewayStats,
}

#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    #[serde(alias = "base64Image")]
    pub base64image: String,
}

#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub text: String,
    pub request_id: String,
}

/// Handle one OCR request. `body` is the raw JSON request body.
#[instrument(skip_all, fields(request_id = %request_id, bytes = body.len()))]
pub async fn recognize(state: &OcrState, body: &[u8], request_id: String) -> Response {
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.stats.in_flight);
    let started = Instant::now();

    let outcome = run(state, body).await;
    let response = match outcome {
        Ok(text) => {
            info!(chars = text.len(), "ocr request completed");
            (
                StatusCode::OK,
                axum::Json(OcrResponse {
                    text,
                    request_id: request_id.clone(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, kind = e.kind(), "ocr request failed");
            e.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

async fn run(state: &OcrState, body: &[u8]) -> Result<String, ApiError> {
    let request: OcrRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid JSON body: {e}")))?;
    let image = ImagePayload::from_base64(&request.base64image)?;

    let cancel = CancellationToken::new();
    // Dropping the handler (client went away) cancels the call too
    let _cancel_on_drop = cancel.clone().drop_guard();

    let execute = state.controller.execute(&image, &cancel);
    tokio::pin!(execute);
    let result = tokio::select! {
        biased;
        result = &mut execute => result,
        () = tokio::time::sleep(state.timeout) => {
            // Let the controller wind down so an answer already in hand is charged
            cancel.cancel();
            execute.await
        }
    };
    result.map_err(ApiError::from)
}
