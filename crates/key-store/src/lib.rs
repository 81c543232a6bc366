//! Credential records and usage accounting storage
//!
//! Holds the provisioned OCR API keys together with their remaining balance
//! and usage counters. Two pool flavours exist:
//!
//! - durable: `FileCredentialStore`, a JSON file of credential records with
//!   per-key balance and expiry, mutated only through the atomic conditional
//!   `apply_usage_delta`
//! - ephemeral: a delimited key list parsed once at startup by
//!   `parse_key_list`, with no accounting at all
//!
//! Records are provisioned and refilled externally; nothing here creates or
//! deletes them. An exhausted or expired key is filtered out at selection time.

pub mod credential;
pub mod ephemeral;
pub mod error;
pub mod file;
pub mod store;

pub use credential::Credential;
pub use ephemeral::parse_key_list;
pub use error::{Error, Result};
pub use file::FileCredentialStore;
pub use store::{CredentialStore, apply_delta, select_eligible};
