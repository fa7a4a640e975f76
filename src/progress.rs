//! Progress tracking for long-running bulk operations.
//!
//! Only one bulk operation (SQL dump import, cover download, daily update)
//! runs at a time. Its progress is published as a [`BulkProgress`] snapshot
//! and it can be asked to stop between items.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactFetcher, FetchError};
use crate::error::{SyncError, SyncResult};

/// State of the bulk operation slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// An operation is in flight.
    Running,
    /// The last operation ran to the end.
    Completed,
    /// The last operation was stopped by an operator.
    Stopped,
    /// The last operation failed outright.
    Error,
}

/// Snapshot of the current or most recent bulk operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkProgress {
    /// Current state.
    pub status: BulkStatus,
    /// Name of the operation, e.g. `download-sql`.
    pub operation: Option<String>,
    /// Items handled so far, failures included.
    pub processed: u64,
    /// Items planned.
    pub total: u64,
    /// Items that failed.
    pub errors: u64,
    /// When the operation started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the operation finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message if the operation failed outright.
    pub message: Option<String>,
}

impl BulkProgress {
    fn start(&mut self, operation: &str) {
        *self = Self {
            status: BulkStatus::Running,
            operation: Some(operation.to_string()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
    }

    fn finish(&mut self, status: BulkStatus, message: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.message = message;
    }

    /// Whether an operation is in flight.
    pub fn is_running(&self) -> bool {
        self.status == BulkStatus::Running
    }
}

#[derive(Default)]
struct TrackerState {
    progress: BulkProgress,
    cancel: Option<CancellationToken>,
}

impl TrackerState {
    fn abort(&mut self) {
        if self.progress.is_running() {
            self.progress
                .finish(BulkStatus::Error, Some("operation aborted".to_string()));
            self.cancel = None;
        }
    }
}

/// Shared slot for the single in-flight bulk operation.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    state: Arc<RwLock<TrackerState>>,
}

impl ProgressTracker {
    /// Create an idle tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `operation`.
    ///
    /// Fails with [`SyncError::Busy`] while another operation holds it.
    pub async fn begin(&self, operation: &str) -> SyncResult<BulkHandle> {
        let mut state = self.state.write().await;
        if state.progress.is_running() {
            let current = state.progress.operation.clone().unwrap_or_default();
            return Err(SyncError::Busy(current));
        }

        let token = CancellationToken::new();
        state.progress.start(operation);
        state.cancel = Some(token.clone());
        info!("Bulk operation {} started", operation);

        Ok(BulkHandle {
            tracker: self.clone(),
            token,
            finished: false,
        })
    }

    /// Current progress snapshot.
    pub async fn snapshot(&self) -> BulkProgress {
        self.state.read().await.progress.clone()
    }

    /// Ask the running operation to stop after its current item.
    ///
    /// Returns false if nothing is running.
    pub async fn stop(&self) -> bool {
        let state = self.state.read().await;
        match (&state.cancel, state.progress.is_running()) {
            (Some(token), true) => {
                info!(
                    "Stop requested for bulk operation {}",
                    state.progress.operation.as_deref().unwrap_or("unknown")
                );
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Handle held by the operation that owns the progress slot.
pub struct BulkHandle {
    tracker: ProgressTracker,
    token: CancellationToken,
    finished: bool,
}

impl BulkHandle {
    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Add `count` planned items.
    pub async fn add_total(&self, count: u64) {
        self.tracker.state.write().await.progress.total += count;
    }

    /// Record one handled item.
    pub async fn item_done(&self, failed: bool) {
        let mut state = self.tracker.state.write().await;
        state.progress.processed += 1;
        if failed {
            state.progress.errors += 1;
        }
    }

    /// Release the slot, recording how the operation ended.
    pub async fn finish<T>(mut self, result: &SyncResult<T>) {
        self.finished = true;
        let mut state = self.tracker.state.write().await;
        let (status, message) = match result {
            Err(e) => (BulkStatus::Error, Some(e.to_string())),
            Ok(_) if self.token.is_cancelled() => (BulkStatus::Stopped, None),
            Ok(_) => (BulkStatus::Completed, None),
        };
        state.progress.finish(status, message);
        state.cancel = None;
        info!(
            "Bulk operation {} finished: {:?} ({} processed, {} errors)",
            state.progress.operation.as_deref().unwrap_or("unknown"),
            status,
            state.progress.processed,
            state.progress.errors
        );
    }
}

impl Drop for BulkHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropped without finish(), e.g. the owning task panicked.
        if let Ok(mut state) = self.tracker.state.try_write() {
            state.abort();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let state = Arc::clone(&self.tracker.state);
                runtime.spawn(async move {
                    state.write().await.abort();
                });
            }
            Err(_) => {
                error!("Bulk operation dropped outside a runtime, progress slot left running");
            }
        }
    }
}

/// Result of fetching one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    /// Items downloaded.
    pub fetched: Vec<String>,
    /// Items already present locally.
    pub skipped: usize,
    /// Items that could not be downloaded.
    pub failed: Vec<String>,
}

/// Download every item of `collection` accepted by `filter` into `dest_dir`.
///
/// With `skip_existing`, items already present in `dest_dir` are not fetched
/// again. Per-item failures are counted; only an unreachable collection is
/// an error.
pub async fn fetch_collection<F>(
    fetcher: &dyn ArtifactFetcher,
    collection: &str,
    dest_dir: &Path,
    filter: F,
    skip_existing: bool,
    handle: &BulkHandle,
) -> SyncResult<FetchSummary>
where
    F: Fn(&str) -> bool,
{
    let available = fetcher.list(collection).await.map_err(|e| match e {
        FetchError::Io(e) => SyncError::Io(e),
        e => SyncError::ExternalFetch(format!("{}: {}", collection, e)),
    })?;
    tokio::fs::create_dir_all(dest_dir).await?;

    let mut summary = FetchSummary::default();
    let mut wanted = Vec::new();
    for name in available.into_iter().filter(|n| filter(n.as_str())) {
        if skip_existing && dest_dir.join(&name).exists() {
            summary.skipped += 1;
        } else {
            wanted.push(name);
        }
    }
    debug!(
        "{}: {} item(s) to fetch, {} already present",
        collection,
        wanted.len(),
        summary.skipped
    );
    handle.add_total(wanted.len() as u64).await;

    for name in wanted {
        if handle.is_cancelled() {
            info!("Fetch of {} stopped", collection);
            break;
        }
        match fetcher.fetch(collection, &name, dest_dir).await {
            Ok(size) => {
                debug!("Fetched {}/{} ({} bytes)", collection, name, size);
                handle.item_done(false).await;
                summary.fetched.push(name);
            }
            Err(e) => {
                warn!("Failed to fetch {}/{}: {}", collection, name, e);
                handle.item_done(true).await;
                summary.failed.push(name);
            }
        }
    }

    Ok(summary)
}
