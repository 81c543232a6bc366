//! Key rotation and quota accounting for the OCR provider
//!
//! Picks which API key to present on each OCR call, skips keys that are
//! depleted or expired, and falls back across the pool when the provider
//! rejects a key for quota reasons.
//!
//! Call lifecycle (`QuotaRetryController::execute`):
//! 1. `SelectionPolicy::next` picks a key not yet tried in this call
//! 2. `OcrClient::recognize` runs with that key
//! 3. Quota rejection → key joins the exclusion set, back to 1
//! 4. Any other failure, cancellation, or an empty pool → the call ends
//! 5. Success → `UsageRecorder::commit` charges the key (best-effort), text returned
//!
//! Two interchangeable policies: `RoundRobin` over an in-process key list,
//! and `LeastUsedWithExpiry` over a durable `CredentialStore`.

pub mod controller;
pub mod error;
pub mod quota;
pub mod recorder;
pub mod selection;

pub use controller::QuotaRetryController;
pub use error::{Error, Result};
pub use quota::{classify_message, classify_status};
pub use recorder::UsageRecorder;
pub use selection::{LeastUsedWithExpiry, RoundRobin, SelectionPolicy};
