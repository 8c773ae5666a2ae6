use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::store::ObjectStore;

/// A cookie file smaller than this is treated as empty or corrupt
const MIN_PLAUSIBLE_BYTES: u64 = 10;

/// Outcome of one sync attempt
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub bytes: u64,
    #[serde(rename = "time")]
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Credential-freshness state for the health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultStatus {
    /// No remote store credentials present; syncing is permanently off
    Unconfigured,
    /// No successful sync yet, or the last attempt failed
    Stale,
    /// The last sync attempt succeeded
    Fresh,
}

/// Mirrors the session-cookie blob from the remote store to a local file.
///
/// The local file is overwritten via write-to-temp-then-rename so concurrent
/// extraction workers never read a half-written credential. A failed sync
/// leaves the previous file byte-for-byte intact: stale-but-available beats
/// absent.
pub struct VaultSync {
    store: Option<Arc<dyn ObjectStore>>,
    bucket: String,
    object: String,
    cookie_file: PathBuf,
    last: Mutex<Option<SyncReport>>,
}

impl VaultSync {
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        bucket: impl Into<String>,
        object: impl Into<String>,
        cookie_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            object: object.into(),
            cookie_file: cookie_file.into(),
            last: Mutex::new(None),
        }
    }

    /// Convenience constructor for the unconfigured (sync disabled) state
    pub fn unconfigured(cookie_file: impl Into<PathBuf>) -> Self {
        Self::new(None, "", "", cookie_file)
    }

    pub fn status(&self) -> VaultStatus {
        if self.store.is_none() {
            return VaultStatus::Unconfigured;
        }
        match &*self.last.lock().expect("vault mutex poisoned") {
            Some(report) if report.success => VaultStatus::Fresh,
            _ => VaultStatus::Stale,
        }
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last.lock().expect("vault mutex poisoned").clone()
    }

    /// Whether the local cookie file exists and looks usable
    pub fn cookies_loaded(&self) -> bool {
        plausible(&self.cookie_file)
    }

    /// The cookie file path, if its contents are worth handing to the engine
    pub fn cookie_file_if_plausible(&self) -> Option<PathBuf> {
        if self.cookies_loaded() {
            Some(self.cookie_file.clone())
        } else {
            None
        }
    }

    /// Download the credential blob and atomically replace the local file.
    ///
    /// Safe to call concurrently with scheduled runs; each caller writes its
    /// own temp file and the last rename wins.
    pub async fn fetch_now(&self) -> SyncReport {
        let Some(store) = &self.store else {
            return SyncReport {
                success: false,
                bytes: 0,
                at: Utc::now(),
                error: Some("remote store not configured".to_string()),
            };
        };

        let report = match store.download(&self.bucket, &self.object).await {
            Ok(body) => match write_atomic(&self.cookie_file, &body).await {
                Ok(()) => {
                    tracing::info!(bytes = body.len(), "cookie file refreshed from vault");
                    SyncReport {
                        success: true,
                        bytes: body.len() as u64,
                        at: Utc::now(),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to write cookie file");
                    SyncReport {
                        success: false,
                        bytes: 0,
                        at: Utc::now(),
                        error: Some(e.to_string()),
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "vault sync failed, keeping previous cookie file");
                SyncReport {
                    success: false,
                    bytes: 0,
                    at: Utc::now(),
                    error: Some(e.to_string()),
                }
            }
        };

        *self.last.lock().expect("vault mutex poisoned") = Some(report.clone());
        report
    }

    /// Lazily refresh when the local file is missing or implausibly small
    pub async fn ensure_plausible(&self) {
        if self.store.is_none() || plausible(&self.cookie_file) {
            return;
        }
        tracing::info!("cookie file missing or too small, triggering vault sync");
        self.fetch_now().await;
    }
}

fn plausible(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() >= MIN_PLAUSIBLE_BYTES)
        .unwrap_or(false)
}

async fn write_atomic(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    tokio::fs::write(&tmp, body).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e.into())
        }
    }
}
