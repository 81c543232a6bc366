//! Quota detection from OCR provider responses
//!
//! Fallback heuristic for providers that report quota exhaustion only in
//! prose. OCR.space, for one, answers an exhausted key with 403 and a message
//! like "You may only perform this action upto maximum 500 number of times
//! within 86400 seconds". Clients translate the result into the tagged
//! `CallError`; the controller never looks at message text.

use ocr_provider::ErrorClassification;

/// Lowercase phrases that mark a quota rejection.
const QUOTA_PATTERNS: &[&str] = &[
    "number of times within",
    "quota",
    "rate limit",
    "limit exceeded",
    "too many requests",
    "insufficient balance",
    "usage limit",
];

/// Classify a provider error message as quota exhaustion or a transient error.
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClassification::QuotaExceeded;
        }
    }
    ErrorClassification::Transient
}

/// Classify a non-2xx provider response by HTTP status and body.
///
/// 429 is always quota. 401/403 are quota when the body says so, otherwise a
/// rejected key (Permanent). Everything else is Transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::QuotaExceeded,
        401 | 403 => match classify_message(body) {
            ErrorClassification::QuotaExceeded => ErrorClassification::QuotaExceeded,
            _ => ErrorClassification::Permanent,
        },
        _ => ErrorClassification::Transient,
    }
}
