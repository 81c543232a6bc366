//! Credential store abstraction
//!
//! Picking a key (`fetch_eligible`) and charging it (`apply_usage_delta`) are
//! two steps: two callers may pick the same key before either charges it. The
//! charge itself is a single conditional update, so balance never goes below
//! zero however the calls interleave.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::credential::Credential;
use crate::error::{Error, Result};

/// Repository of credential records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Fetch the preferred eligible credential whose id is not in `excluded`.
    ///
    /// Preference: soonest `expires_at` first (keys without expiry last), then
    /// lowest `usage_count`. Returns `Error::NotFound` when nothing qualifies.
    fn fetch_eligible<'a>(
        &'a self,
        excluded: &'a HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;

    /// Atomically add `balance_delta` to balance and `usage_delta` to usage.
    ///
    /// Fails with `Error::Conflict` (and changes nothing) when the result
    /// would leave balance below zero. Returns the updated record.
    fn apply_usage_delta<'a>(
        &'a self,
        id: &'a str,
        balance_delta: i64,
        usage_delta: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>>;

    /// Copy of every record, for health reporting.
    fn snapshot(&self) -> Pin<Box<dyn Future<Output = Vec<Credential>> + Send + '_>>;
}

/// Pick the preferred eligible credential among `records`.
pub fn select_eligible<'a, I>(
    records: I,
    excluded: &HashSet<String>,
    now: DateTime<Utc>,
) -> Option<&'a Credential>
where
    I: IntoIterator<Item = &'a Credential>,
{
    records
        .into_iter()
        .filter(|c| c.is_eligible(now) && !excluded.contains(&c.id))
        .min_by(|a, b| {
            // None sorts after every concrete expiry
            let expiry = match (a.expires_at, b.expires_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            expiry
                .then(a.usage_count.cmp(&b.usage_count))
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Apply a usage delta in place, refusing to take balance below zero.
///
/// On error the credential is left untouched.
pub fn apply_delta(credential: &mut Credential, balance_delta: i64, usage_delta: u64) -> Result<()> {
    let balance = if balance_delta < 0 {
        credential
            .balance
            .checked_sub(balance_delta.unsigned_abs())
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "credential {} has balance {}, cannot apply {balance_delta}",
                    credential.id, credential.balance
                ))
            })?
    } else {
        credential
            .balance
            .checked_add(balance_delta as u64)
            .ok_or_else(|| Error::Conflict(format!("credential {} balance overflow", credential.id)))?
    };
    let usage_count = credential
        .usage_count
        .checked_add(usage_delta)
        .ok_or_else(|| Error::Conflict(format!("credential {} usage overflow", credential.id)))?;

    credential.balance = balance;
    credential.usage_count = usage_count;
    Ok(())
}
