//! Maintenance orchestrator.
//!
//! Binds the recurring maintenance tasks to the concrete catalog operations
//! and exposes the control surface used by the admin interface and the CLI.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactFetcher, COVER_COLLECTION, DAILY_COLLECTION, SQL_COLLECTION};
use crate::config::{SyncConfig, TaskScheduleConfig};
use crate::error::{SyncError, SyncResult};
use crate::filename::ArchiveFilenameParser;
use crate::health::{HealthChecker, HealthReport};
use crate::progress::{fetch_collection, BulkHandle, BulkProgress, FetchSummary, ProgressTracker};
use crate::registry::{handler, TaskRegistry, TaskStatus, TriggerOutcome};
use crate::repair::repair_missing_filenames;
use crate::scanner::{ArchiveIndexer, RebuildSummary};
use crate::store::{ArchiveMapping, CatalogStats, CatalogStore};

/// Fetch daily deltas, rebuild the archive mappings and repair filenames.
pub const DAILY_UPDATE_TASK: &str = "daily-update";
/// Refresh full-text search vectors.
pub const SEARCH_VECTORS_TASK: &str = "search-vectors";
/// Run the catalog health check.
pub const HEALTH_CHECK_TASK: &str = "health-check";
/// Download bulk SQL dumps and cover archives.
pub const BULK_DOWNLOAD_TASK: &str = "bulk-download";

/// Names of the bound tasks.
pub const TASK_NAMES: [&str; 4] = [
    DAILY_UPDATE_TASK,
    SEARCH_VECTORS_TASK,
    HEALTH_CHECK_TASK,
    BULK_DOWNLOAD_TASK,
];

/// Outcome of a SQL dump download and import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlImportSummary {
    /// Download results.
    pub fetch: FetchSummary,
    /// Dumps applied to the store.
    pub imported: Vec<String>,
    /// Dumps the store rejected.
    pub failed: Vec<String>,
}

/// Outcome of a full daily update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUpdateSummary {
    /// Delta download results; `None` if the origin could not be reached.
    pub fetch: Option<FetchSummary>,
    /// Mapping rebuild results.
    pub rebuild: RebuildSummary,
    /// Filename records created.
    pub filenames_created: u64,
}

struct Inner {
    config: SyncConfig,
    parser: ArchiveFilenameParser,
    store: Arc<dyn CatalogStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    registry: TaskRegistry,
    progress: ProgressTracker,
}

/// Runs catalog maintenance on a schedule and on demand.
///
/// Cloning yields another handle to the same orchestrator.
#[derive(Clone)]
pub struct MaintenanceOrchestrator {
    inner: Arc<Inner>,
}

impl MaintenanceOrchestrator {
    /// Create an orchestrator; call [`start`](Self::start) to arm the schedules.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn CatalogStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> SyncResult<Self> {
        let timezone = config.timezone()?;
        Ok(Self {
            inner: Arc::new(Inner {
                parser: config.filename_parser(),
                config,
                store,
                fetcher,
                registry: TaskRegistry::new(timezone),
                progress: ProgressTracker::new(),
            }),
        })
    }

    /// The configuration in effect.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The underlying task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    fn task_schedule(&self, name: &str) -> Option<&TaskScheduleConfig> {
        let schedule = &self.inner.config.schedule;
        match name {
            DAILY_UPDATE_TASK => Some(&schedule.daily_update),
            SEARCH_VECTORS_TASK => Some(&schedule.search_vectors),
            HEALTH_CHECK_TASK => Some(&schedule.health_check),
            BULK_DOWNLOAD_TASK => Some(&schedule.bulk_download),
            _ => None,
        }
    }

    /// Register the bound tasks without starting the scheduler.
    ///
    /// Already registered tasks are left as they are. Tasks disabled in the
    /// configuration are registered with their schedule disarmed.
    pub async fn register_tasks(&self) -> SyncResult<()> {
        for name in TASK_NAMES {
            let Some(task) = self.task_schedule(name) else {
                continue;
            };
            match self
                .inner
                .registry
                .register(name, &task.cron, self.bind(name))
                .await
            {
                Ok(()) => {
                    if !task.enabled {
                        self.inner.registry.set_enabled(name, false).await?;
                    }
                }
                Err(SyncError::DuplicateTask(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Register the bound tasks and start the scheduler.
    pub async fn start(&self) -> SyncResult<()> {
        self.register_tasks().await?;
        self.inner.registry.start().await;
        info!("Maintenance orchestrator started");
        Ok(())
    }

    /// Stop scheduling. In-flight operations run to completion.
    pub async fn stop(&self) {
        self.inner.registry.stop().await;
        info!("Maintenance orchestrator stopped");
    }

    /// Run a bound task now and wait for it.
    pub async fn run_now(&self, name: &str) -> SyncResult<TriggerOutcome> {
        self.inner.registry.trigger(name).await
    }

    /// Start a bound task now without waiting; `None` if it is already running.
    pub async fn run_detached(
        &self,
        name: &str,
    ) -> SyncResult<Option<JoinHandle<SyncResult<()>>>> {
        self.inner.registry.trigger_detached(name).await
    }

    /// Arm or disarm a task's schedule.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> SyncResult<()> {
        self.inner.registry.set_enabled(name, enabled).await
    }

    /// Scheduler snapshot.
    pub async fn status(&self) -> BTreeMap<String, TaskStatus> {
        self.inner.registry.status().await
    }

    /// Progress of the current or last bulk operation.
    pub async fn bulk_progress(&self) -> BulkProgress {
        self.inner.progress.snapshot().await
    }

    /// Ask the running bulk operation to stop; false if none is running.
    pub async fn stop_bulk(&self) -> bool {
        self.inner.progress.stop().await
    }

    /// Handler for a bound task.
    ///
    /// Handlers hold a weak reference so the registry does not keep the
    /// orchestrator alive.
    fn bind(&self, name: &'static str) -> crate::registry::TaskHandler {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        handler(move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    debug!(task = name, "Orchestrator gone, nothing to do");
                    return Ok(());
                };
                let orchestrator = MaintenanceOrchestrator { inner };
                let result = orchestrator.run_bound(name).await;
                if let Err(e) = &result {
                    error!(task = name, "Maintenance operation failed: {}", e);
                }
                result
            }
        })
    }

    async fn run_bound(&self, name: &str) -> SyncResult<()> {
        match name {
            DAILY_UPDATE_TASK => self.daily_update_task().await.map(|_| ()),
            SEARCH_VECTORS_TASK => self.update_search_vectors().await,
            HEALTH_CHECK_TASK => {
                let report = self.health_check().await;
                for issue in &report.issues {
                    warn!("Catalog issue: {}", issue);
                }
                Ok(())
            }
            BULK_DOWNLOAD_TASK => self.bulk_download_task().await,
            other => Err(SyncError::TaskNotFound(other.to_string())),
        }
    }

    /// Fetch daily deltas, then rebuild the mappings and repair filenames.
    ///
    /// An unreachable origin is logged and the local steps still run.
    pub async fn daily_update_task(&self) -> SyncResult<DailyUpdateSummary> {
        let fetch = match self.update_daily().await {
            Ok(summary) => Some(summary),
            Err(e @ (SyncError::ExternalFetch(_) | SyncError::Busy(_))) => {
                warn!("Daily delta fetch skipped: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        let rebuild = self.update_zip_mappings().await?;
        let filenames_created = self.create_missing_filenames().await?;

        Ok(DailyUpdateSummary {
            fetch,
            rebuild,
            filenames_created,
        })
    }

    /// Download the SQL dumps, then the cover archives.
    ///
    /// An unreachable collection is logged and the other one is still
    /// fetched; the task fails only if both steps fail or a step fails for
    /// another reason.
    pub async fn bulk_download_task(&self) -> SyncResult<()> {
        let sql = self.download_sql().await.map(|_| ());
        let covers = self.download_covers().await.map(|_| ());

        match (sql, covers) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(sql), Err(covers)) => {
                warn!("Cover download failed too: {}", covers);
                Err(sql)
            }
            (Err(e @ SyncError::ExternalFetch(_)), Ok(()))
            | (Ok(()), Err(e @ SyncError::ExternalFetch(_))) => {
                warn!("Bulk download incomplete: {}", e);
                Ok(())
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        }
    }

    /// Download the bulk SQL dumps and apply them to the store.
    pub async fn download_sql(&self) -> SyncResult<SqlImportSummary> {
        let handle = self.inner.progress.begin("download-sql").await?;
        let result = self.download_sql_with(&handle).await;
        handle.finish(&result).await;
        result
    }

    async fn download_sql_with(&self, handle: &BulkHandle) -> SyncResult<SqlImportSummary> {
        let sql_dir = &self.inner.config.paths.sql_dir;
        let fetch = fetch_collection(
            self.inner.fetcher.as_ref(),
            SQL_COLLECTION,
            sql_dir,
            is_sql_dump,
            false,
            handle,
        )
        .await?;

        let mut summary = SqlImportSummary {
            fetch,
            ..Default::default()
        };
        handle.add_total(summary.fetch.fetched.len() as u64).await;
        for name in &summary.fetch.fetched {
            if handle.is_cancelled() {
                info!("SQL import stopped");
                break;
            }
            match self.import_dump(&sql_dir.join(name)).await {
                Ok(()) => {
                    info!("Imported SQL dump {}", name);
                    handle.item_done(false).await;
                    summary.imported.push(name.clone());
                }
                Err(e) => {
                    warn!("Failed to import SQL dump {}: {}", name, e);
                    handle.item_done(true).await;
                    summary.failed.push(name.clone());
                }
            }
        }
        Ok(summary)
    }

    async fn import_dump(&self, path: &Path) -> SyncResult<()> {
        let script = read_dump(path.to_path_buf()).await?;
        self.inner.store.execute_script(&script).await
    }

    /// Download the cover archives.
    pub async fn download_covers(&self) -> SyncResult<FetchSummary> {
        let handle = self.inner.progress.begin("download-covers").await?;
        let result = fetch_collection(
            self.inner.fetcher.as_ref(),
            COVER_COLLECTION,
            &self.inner.config.paths.cover_dir,
            |name| name.ends_with(".zip"),
            false,
            &handle,
        )
        .await;
        handle.finish(&result).await;
        result
    }

    /// Download daily delta archives not yet present locally.
    pub async fn update_daily(&self) -> SyncResult<FetchSummary> {
        let handle = self.inner.progress.begin("update-daily").await?;
        let parser = &self.inner.parser;
        let result = fetch_collection(
            self.inner.fetcher.as_ref(),
            DAILY_COLLECTION,
            &self.inner.config.paths.archive_dir,
            |name| parser.parse(name).is_ok(),
            true,
            &handle,
        )
        .await;
        handle.finish(&result).await;
        result
    }

    /// Rebuild the archive mapping table from the archive directory.
    pub async fn update_zip_mappings(&self) -> SyncResult<RebuildSummary> {
        ArchiveIndexer::new(self.inner.parser.clone(), Arc::clone(&self.inner.store))
            .rebuild(&self.inner.config.paths.archive_dir)
            .await
    }

    /// Create filename records for items lacking one.
    pub async fn create_missing_filenames(&self) -> SyncResult<u64> {
        repair_missing_filenames(&self.inner.store).await
    }

    /// Refresh the full-text search vectors.
    pub async fn update_search_vectors(&self) -> SyncResult<()> {
        info!("Refreshing search vectors");
        self.inner.store.refresh_search_vectors().await
    }

    /// Run the catalog health check.
    pub async fn health_check(&self) -> HealthReport {
        HealthChecker::new(
            Arc::clone(&self.inner.store),
            &self.inner.config.canonical_format,
        )
        .check()
        .await
    }

    /// Catalog summary counters.
    pub async fn stats(&self) -> SyncResult<CatalogStats> {
        self.inner.store.stats().await
    }

    /// The archive holding `book_id`.
    pub async fn find_archive(&self, book_id: i64) -> SyncResult<Option<ArchiveMapping>> {
        self.inner
            .store
            .find_archive(book_id, &self.inner.config.canonical_format)
            .await
    }
}

fn is_sql_dump(name: &str) -> bool {
    name.ends_with(".sql") || name.ends_with(".sql.gz")
}

/// Read a dump, gunzipping it when compressed.
///
/// The whole script is held in memory: the store applies a dump as one
/// script, and the upstream dumps are per-table files of at most a few
/// hundred megabytes. Bytes that are not valid UTF-8 are replaced rather
/// than failing the import.
async fn read_dump(path: PathBuf) -> SyncResult<String> {
    tokio::task::spawn_blocking(move || -> SyncResult<String> {
        let file = std::fs::File::open(&path)?;
        let mut bytes = Vec::new();
        if path.extension().is_some_and(|ext| ext == "gz") {
            flate2::read::GzDecoder::new(file).read_to_end(&mut bytes)?;
        } else {
            std::io::BufReader::new(file).read_to_end(&mut bytes)?;
        }
        Ok(match String::from_utf8(bytes) {
            Ok(script) => script,
            Err(e) => {
                warn!("{} is not valid UTF-8, replacing invalid bytes", path.display());
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        })
    })
    .await
    .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}
