//! Durable credential store backed by a JSON file
//!
//! The file maps credential ids to records and is the source of truth: it is
//! shared with the provisioning job that adds and refills keys, and possibly
//! with other gateway processes. Every read re-reads it. Every usage charge
//! is a read-modify-write of the whole file under an exclusive advisory lock
//! on a sidecar `<file>.lock`, so no writer's changes are lost. Writes use
//! atomic temp-file + rename, so readers never need the lock.
//!
//! The in-memory map is only the last view read from disk. It is replaced
//! after a read or a completed write, never edited in place.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::Utc;
use fs2::FileExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::store::{CredentialStore, apply_delta, select_eligible};

type Records = BTreeMap<String, Credential>;

/// Credential file manager shared by every request of the process.
pub struct FileCredentialStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes this process's file operations; holds the last view read.
    state: Mutex<Records>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}`. Every selection then
    /// reports exhaustion until records are provisioned.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let lock_path = lock_path_for(&path);
        let state = {
            let path = path.clone();
            let lock_path = lock_path.clone();
            blocking(move || {
                let _lock = FileLock::acquire(&lock_path)?;
                if path.exists() {
                    read_records(&path)
                } else {
                    let state = Records::new();
                    write_atomic(&path, &state)?;
                    Ok(state)
                }
            })
            .await?
        };
        info!(path = %path.display(), keys = state.len(), "loaded credential store");

        Ok(Self {
            path,
            lock_path,
            state: Mutex::new(state),
        })
    }

    /// Re-read the file now. Returns the number of records.
    pub async fn reload(&self) -> Result<usize> {
        let state = self.refresh().await?;
        info!(path = %self.path.display(), keys = state.len(), "reloaded credential store");
        Ok(state.len())
    }

    /// Get a clone of a specific credential as currently on disk.
    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.current().await.get(id).cloned()
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.current().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock, re-read the file and replace the in-memory view.
    async fn refresh(&self) -> Result<MutexGuard<'_, Records>> {
        let mut state = self.state.lock().await;
        let path = self.path.clone();
        *state = blocking(move || read_records(&path)).await?;
        Ok(state)
    }

    /// Fresh view, or the last one read if the file can't be read right now.
    async fn current(&self) -> MutexGuard<'_, Records> {
        match self.refresh().await {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "re-reading credential file failed, using last view");
                self.state.lock().await
            }
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn fetch_eligible<'a>(
        &'a self,
        excluded: &'a HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.refresh().await?;
            select_eligible(state.values(), excluded, Utc::now())
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "no eligible API key ({} stored, {} excluded)",
                        state.len(),
                        excluded.len()
                    ))
                })
        })
    }

    /// The whole read-modify-write runs on one blocking task holding the file
    /// lock. Dropping this future cannot interrupt it; the in-memory view is
    /// replaced only with what was actually written.
    fn apply_usage_delta<'a>(
        &'a self,
        id: &'a str,
        balance_delta: i64,
        usage_delta: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Credential>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;

            let path = self.path.clone();
            let lock_path = self.lock_path.clone();
            let key_id = id.to_string();
            let (records, updated) = blocking(move || {
                let _lock = FileLock::acquire(&lock_path)?;
                let mut records = read_records(&path)?;
                let credential = records
                    .get_mut(&key_id)
                    .ok_or_else(|| Error::NotFound(format!("credential {key_id} not in store")))?;
                apply_delta(credential, balance_delta, usage_delta)?;
                let updated = credential.clone();
                write_atomic(&path, &records)?;
                Ok((records, updated))
            })
            .await?;

            *state = records;
            debug!(
                key_id = id,
                balance = updated.balance,
                usage_count = updated.usage_count,
                "applied usage delta"
            );
            Ok(updated)
        })
    }

    fn snapshot(&self) -> Pin<Box<dyn Future<Output = Vec<Credential>> + Send + '_>> {
        Box::pin(async move { self.current().await.values().cloned().collect() })
    }
}

/// Run blocking file work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(format!("credential file task failed: {e}")))?
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "keys".into());
    name.push(".lock");
    path.with_file_name(name)
}

/// Exclusive advisory lock on the sidecar lock file, released on drop.
struct FileLock(std::fs::File);

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let mut options = std::fs::OpenOptions::new();
        options.create(true).truncate(false).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(path)
            .map_err(|e| Error::Io(format!("opening credential lock file: {e}")))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| Error::Io(format!("locking credential file: {e}")))?;
        Ok(Self(file))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            warn!(error = %e, "unlocking credential file failed");
        }
    }
}

fn read_records(path: &Path) -> Result<Records> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
    let mut records: Records = serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing credential file: {e}")))?;
    for (id, credential) in records.iter_mut() {
        credential.id = id.clone();
    }
    Ok(records)
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file holds API keys.
/// Callers hold the file lock.
fn write_atomic(path: &Path, data: &Records) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".keys.tmp.{}", std::process::id()));

    let written = write_private(&tmp_path, json.as_bytes()).and_then(|()| {
        std::fs::rename(&tmp_path, path)
            .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))
    });
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    written?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }
    Ok(())
}
