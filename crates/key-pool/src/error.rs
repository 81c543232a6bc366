//! Error types for pool operations

use ocr_provider::CallError;

/// Terminal outcome of a rotation call.
///
/// Per-key quota rejections never appear here: they are retried on the next
/// key and only surface as `PoolExhausted` once no key is left.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Non-quota downstream failure, never retried.
    #[error("provider error: {0}")]
    Provider(CallError),

    /// Usage commit failed after a successful call. Logged, not returned.
    #[error("usage accounting failed: {0}")]
    Accounting(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("credential store error: {0}")]
    Store(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
