//! Types shared by the OCR key gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
