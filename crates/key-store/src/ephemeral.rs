//! Ephemeral key pool parsed from configuration
//!
//! The key list is read once at startup from a delimited string (env var or
//! secrets file). There is no accounting: usage resets on restart, and a key
//! rejected for quota is only skipped for the rest of that call.

use std::collections::HashSet;

use ocr_provider::ApiKey;
use tracing::warn;

/// Split a `,`, `;` or newline delimited key list into positional keys.
///
/// Ids are `key-0`, `key-1`, … in list order; blank entries are dropped and
/// repeated keys keep their first position. Every key shares `endpoint`.
pub fn parse_key_list(raw: &str, endpoint: Option<&str>) -> Vec<ApiKey> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    for entry in raw.split([',', ';', '\n']) {
        let secret = entry.trim();
        if secret.is_empty() {
            continue;
        }
        if !seen.insert(secret) {
            warn!(position = keys.len(), "duplicate API key in key list, ignoring");
            continue;
        }
        let key = ApiKey::new(format!("key-{}", keys.len()), secret);
        keys.push(match endpoint {
            Some(endpoint) => key.with_endpoint(endpoint),
            None => key,
        });
    }
    keys
}
