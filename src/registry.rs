//! Registry of named recurring maintenance tasks.
//!
//! A single dispatcher task sleeps until the earliest armed firing, then
//! spawns the handlers that are due. Each task carries an exclusivity guard:
//! a firing that arrives while the previous one is still running is dropped
//! and logged, never queued. Different tasks may run concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};

/// Upper bound on how long the dispatcher sleeps with nothing armed.
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Future returned by a task handler.
pub type TaskFuture = BoxFuture<'static, SyncResult<()>>;

/// Idempotent operation bound to a task name.
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Source of the current time used to evaluate schedules.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A parsed five-field cron expression.
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    /// Parse `minute hour day-of-month month day-of-week`.
    pub fn parse(expression: &str) -> SyncResult<Self> {
        let invalid = |message: String| SyncError::InvalidSchedule {
            expression: expression.to_string(),
            message,
        };

        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", fields)));
        }

        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// The source expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`, evaluated in `timezone`.
    pub fn next_after(&self, after: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
        self.cron
            .find_next_occurrence(&after.with_timezone(&timezone), false)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schedule").field(&self.expression).finish()
    }
}

/// Read-only view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Cron expression.
    pub schedule: String,
    /// Whether the schedule trigger is armed.
    pub enabled: bool,
    /// Whether an invocation is in flight.
    pub running: bool,
    /// When the last invocation finished.
    pub last_run: Option<DateTime<Utc>>,
    /// Next scheduled firing, if armed.
    pub next_run: Option<DateTime<Utc>>,
    /// Error of the last invocation, if it failed.
    pub last_error: Option<String>,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The handler ran and succeeded.
    Completed,
    /// The handler ran and failed.
    Failed(String),
    /// The task was already running; nothing was executed.
    Skipped,
}

struct TaskEntry {
    schedule: Schedule,
    handler: TaskHandler,
    enabled: bool,
    running: Arc<AtomicBool>,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    next_run: Option<DateTime<Utc>>,
}

/// Clears the running flag when the invocation ends, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Dispatcher {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    tasks: RwLock<BTreeMap<String, TaskEntry>>,
    // Outlives `stop()` so a restarted registry still sees in-flight runs.
    running: RwLock<BTreeMap<String, Arc<AtomicBool>>>,
    timezone: Tz,
    clock: Clock,
    wake: Notify,
    dispatcher: Mutex<Option<Dispatcher>>,
}

/// Named, idempotently registered recurring tasks.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

impl TaskRegistry {
    /// Create an empty registry evaluating schedules in `timezone`.
    pub fn new(timezone: Tz) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        Self::with_clock(timezone, clock)
    }

    /// Create an empty registry that reads the current time from `clock`.
    pub fn with_clock(timezone: Tz, clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(BTreeMap::new()),
                running: RwLock::new(BTreeMap::new()),
                timezone,
                clock,
                wake: Notify::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Time zone schedules are evaluated in.
    pub fn timezone(&self) -> Tz {
        self.inner.timezone
    }

    /// Register a task and arm its schedule.
    ///
    /// Registering a name twice is a no-op that leaves the existing task
    /// untouched; the duplicate is logged and reported as
    /// [`SyncError::DuplicateTask`]. A name registered again after
    /// [`stop`](Self::stop) shares the running flag of its earlier
    /// registration, so a run still in flight keeps excluding new ones.
    pub async fn register(
        &self,
        name: &str,
        schedule: &str,
        handler: TaskHandler,
    ) -> SyncResult<()> {
        let mut tasks = self.inner.tasks.write().await;
        if tasks.contains_key(name) {
            warn!(task = name, "Ignoring duplicate task registration");
            return Err(SyncError::DuplicateTask(name.to_string()));
        }

        let schedule = Schedule::parse(schedule)?;
        let next_run = schedule.next_after(self.now(), self.inner.timezone);
        let running = Arc::clone(
            self.inner
                .running
                .write()
                .await
                .entry(name.to_string())
                .or_default(),
        );
        info!(
            task = name,
            schedule = schedule.expression(),
            "Registered task, next run at {:?}",
            next_run
        );
        tasks.insert(
            name.to_string(),
            TaskEntry {
                schedule,
                handler,
                enabled: true,
                running,
                last_run: None,
                last_error: None,
                next_run,
            },
        );
        drop(tasks);

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Start the dispatcher. Calling it again while started does nothing.
    pub async fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock().await;
        if dispatcher.is_some() {
            debug!("Task dispatcher already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_dispatcher(Arc::clone(&self.inner), shutdown_rx));
        *dispatcher = Some(Dispatcher {
            shutdown_tx,
            handle,
        });
        info!("Task registry started");
    }

    /// Whether the dispatcher is running.
    pub async fn is_started(&self) -> bool {
        self.inner.dispatcher.lock().await.is_some()
    }

    /// Stop the dispatcher and clear the registry.
    ///
    /// In-flight handlers are left to finish; only future firings are
    /// suppressed.
    pub async fn stop(&self) {
        if let Some(dispatcher) = self.inner.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
            if let Err(e) = dispatcher.handle.await {
                warn!("Task dispatcher ended with error: {}", e);
            }
        }

        let mut tasks = self.inner.tasks.write().await;
        let in_flight = tasks
            .values()
            .filter(|t| t.running.load(Ordering::Acquire))
            .count();
        if in_flight > 0 {
            info!("{} task(s) still running, letting them finish", in_flight);
        }
        tasks.clear();
        info!("Task registry stopped");
    }

    /// Arm or disarm a task's schedule trigger.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> SyncResult<()> {
        let mut tasks = self.inner.tasks.write().await;
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| SyncError::TaskNotFound(name.to_string()))?;

        entry.enabled = enabled;
        entry.next_run = if enabled {
            entry.schedule.next_after(self.now(), self.inner.timezone)
        } else {
            None
        };
        drop(tasks);

        info!(task = name, enabled, "Task schedule updated");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Run a task now and wait for it, bypassing its schedule.
    ///
    /// Honours the exclusivity guard: if the task is already running the
    /// call returns [`TriggerOutcome::Skipped`] without executing anything.
    pub async fn trigger(&self, name: &str) -> SyncResult<TriggerOutcome> {
        let Some(handle) = self.trigger_detached(name).await? else {
            return Ok(TriggerOutcome::Skipped);
        };

        Ok(match handle.await {
            Ok(Ok(())) => TriggerOutcome::Completed,
            Ok(Err(e)) => TriggerOutcome::Failed(e.to_string()),
            Err(e) => TriggerOutcome::Failed(format!("task aborted: {}", e)),
        })
    }

    /// Start a task now without waiting for it.
    ///
    /// Returns `None` when the task was already running.
    pub async fn trigger_detached(
        &self,
        name: &str,
    ) -> SyncResult<Option<JoinHandle<SyncResult<()>>>> {
        let (handler, running) = {
            let tasks = self.inner.tasks.read().await;
            let entry = tasks
                .get(name)
                .ok_or_else(|| SyncError::TaskNotFound(name.to_string()))?;
            (Arc::clone(&entry.handler), Arc::clone(&entry.running))
        };

        info!(task = name, "Manually triggering task");
        Ok(execute(Arc::clone(&self.inner), name.to_string(), handler, running))
    }

    /// Snapshot of every registered task.
    pub async fn status(&self) -> BTreeMap<String, TaskStatus> {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    TaskStatus {
                        schedule: entry.schedule.expression().to_string(),
                        enabled: entry.enabled,
                        running: entry.running.load(Ordering::Acquire),
                        last_run: entry.last_run,
                        next_run: entry.next_run,
                        last_error: entry.last_error.clone(),
                    },
                )
            })
            .collect()
    }

    /// Whether a task with this name is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.inner.tasks.read().await.contains_key(name)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    /// Fire every armed task whose next run is at or before `now`.
    ///
    /// Returns the names of the tasks that were started.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<String> {
        fire_due(&self.inner, now).await
    }
}

/// Spawn `handler` unless the task is already running.
fn execute(
    inner: Arc<Inner>,
    name: String,
    handler: TaskHandler,
    running: Arc<AtomicBool>,
) -> Option<JoinHandle<SyncResult<()>>> {
    if running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        warn!(task = %name, "Task is still running, skipping this firing");
        return None;
    }

    Some(tokio::spawn(async move {
        let guard = RunningGuard(Arc::clone(&running));
        debug!(task = %name, "Task started");
        let result = handler().await;

        let finished = (inner.clock)();
        match &result {
            Ok(()) => info!(task = %name, "Task completed"),
            Err(e) => error!(task = %name, "Task failed: {}", e),
        }

        // The registry may have been stopped while the handler was running.
        let mut tasks = inner.tasks.write().await;
        if let Some(entry) = tasks.get_mut(&name) {
            entry.last_run = Some(finished);
            entry.last_error = result.as_ref().err().map(|e| e.to_string());
        }
        drop(tasks);
        drop(guard);

        result
    }))
}

async fn fire_due(inner: &Arc<Inner>, now: DateTime<Utc>) -> Vec<String> {
    let due: Vec<(String, TaskHandler, Arc<AtomicBool>)> = {
        let mut tasks = inner.tasks.write().await;
        tasks
            .iter_mut()
            .filter(|(_, entry)| entry.enabled && entry.next_run.is_some_and(|at| at <= now))
            .map(|(name, entry)| {
                entry.next_run = entry.schedule.next_after(now, inner.timezone);
                (
                    name.clone(),
                    Arc::clone(&entry.handler),
                    Arc::clone(&entry.running),
                )
            })
            .collect()
    };

    let mut started = Vec::new();
    for (name, handler, running) in due {
        debug!(task = %name, "Schedule fired");
        if execute(Arc::clone(inner), name.clone(), handler, running).is_some() {
            started.push(name);
        }
    }
    started
}

async fn next_wakeup(inner: &Inner) -> Option<DateTime<Utc>> {
    inner
        .tasks
        .read()
        .await
        .values()
        .filter(|entry| entry.enabled)
        .filter_map(|entry| entry.next_run)
        .min()
}

async fn run_dispatcher(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("Task dispatcher started (timezone: {})", inner.timezone);

    loop {
        let sleep_for = match next_wakeup(&inner).await {
            Some(at) => (at - (inner.clock)()).to_std().unwrap_or(Duration::ZERO),
            None => IDLE_WAKEUP,
        };

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Task dispatcher received shutdown signal");
                break;
            }
            _ = inner.wake.notified() => {
                debug!("Task dispatcher woken up, recomputing schedule");
            }
            _ = tokio::time::sleep(sleep_for) => {
                fire_due(&inner, (inner.clock)()).await;
            }
        }
    }

    info!("Task dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn counting_handler(counter: Arc<AtomicUsize>) -> TaskHandler {
        handler(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_schedule_parse() {
        assert!(Schedule::parse("0 3 * * *").is_ok());
        assert!(Schedule::parse("*/15 * * * 1-5").is_ok());
        assert!(matches!(
            Schedule::parse("0 0 3 * * *"),
            Err(SyncError::InvalidSchedule { .. })
        ));
        assert!(Schedule::parse("61 * * * *").is_err());
        assert!(Schedule::parse("daily").is_err());
    }

    #[test]
    fn test_schedule_next_after_respects_timezone() {
        let schedule = Schedule::parse("0 3 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 4, 0, 0).unwrap();

        assert_eq!(
            schedule.next_after(after, chrono_tz::UTC),
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 0, 0).unwrap())
        );
        // 03:00 in Moscow is midnight UTC.
        assert_eq!(
            schedule.next_after(after, chrono_tz::Europe::Moscow),
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_a_noop() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .register("daily-update", "0 3 * * *", counting_handler(Arc::clone(&first)))
            .await
            .unwrap();
        registry.set_enabled("daily-update", false).await.unwrap();

        let result = registry
            .register("daily-update", "0 4 * * *", counting_handler(Arc::clone(&second)))
            .await;
        assert!(matches!(result, Err(SyncError::DuplicateTask(_))));

        let status = registry.status().await;
        assert_eq!(status.len(), 1);
        let task = &status["daily-update"];
        assert_eq!(task.schedule, "0 3 * * *");
        assert!(!task.enabled);

        registry.trigger("daily-update").await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_names() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        assert!(matches!(
            registry.set_enabled("nonexistent", false).await,
            Err(SyncError::TaskNotFound(_))
        ));
        assert!(matches!(
            registry.trigger("nonexistent").await,
            Err(SyncError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_not_registered() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(registry
            .register("broken", "not a cron", counting_handler(counter))
            .await
            .is_err());
        assert!(!registry.contains("broken").await);
    }

    #[tokio::test]
    async fn test_set_enabled_arms_and_disarms() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register("health-check", "0 * * * *", counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();
        registry
            .register("search-vectors", "0 * * * *", counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();
        assert!(registry.status().await["health-check"].next_run.is_some());

        registry.set_enabled("health-check", false).await.unwrap();
        let status = registry.status().await;
        assert!(status["health-check"].next_run.is_none());
        assert!(status["search-vectors"].next_run.is_some());

        let started = registry.fire_due(Utc::now() + chrono::Duration::hours(2)).await;
        assert_eq!(started, vec!["search-vectors".to_string()]);

        registry.set_enabled("health-check", true).await.unwrap();
        assert!(registry.status().await["health-check"].next_run.is_some());
    }

    #[tokio::test]
    async fn test_fire_due_runs_handler_and_rearms() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register(
                "health-check",
                "* * * * *",
                handler(move || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::minutes(5);
        let started = registry.fire_due(now).await;
        assert_eq!(started, vec!["health-check".to_string()]);

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let next = registry.status().await["health-check"].next_run.unwrap();
        assert!(next > now);

        // Not due again until the next minute after `now`.
        assert!(registry.fire_due(now).await.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_while_running_is_skipped() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handler_release = Arc::clone(&release);
        let handler_calls = Arc::clone(&calls);
        registry
            .register(
                "update-zip-mappings",
                "0 3 * * *",
                handler(move || {
                    let release = Arc::clone(&handler_release);
                    let calls = Arc::clone(&handler_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let first = registry
            .trigger_detached("update-zip-mappings")
            .await
            .unwrap()
            .unwrap();

        // Wait for the first invocation to be in flight.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(registry.status().await["update-zip-mappings"].running);

        assert_eq!(
            registry.trigger("update-zip-mappings").await.unwrap(),
            TriggerOutcome::Skipped
        );
        let now = Utc::now() + chrono::Duration::days(2);
        assert!(registry.fire_due(now).await.is_empty());

        // Registering again mid-run changes nothing.
        let result = registry
            .register(
                "update-zip-mappings",
                "0 4 * * *",
                handler(|| async { Ok(()) }),
            )
            .await;
        assert!(matches!(result, Err(SyncError::DuplicateTask(_))));
        let status = registry.status().await;
        assert!(status["update-zip-mappings"].running);
        assert_eq!(status["update-zip-mappings"].schedule, "0 3 * * *");

        release.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let status = registry.status().await;
        assert!(!status["update-zip-mappings"].running);
        assert!(status["update-zip-mappings"].last_run.is_some());
    }

    #[tokio::test]
    async fn test_failed_task_stays_registered() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        registry
            .register(
                "bulk-download",
                "0 2 * * 0",
                handler(|| async { Err(SyncError::ExternalFetch("origin down".to_string())) }),
            )
            .await
            .unwrap();

        let outcome = registry.trigger("bulk-download").await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Failed(ref e) if e.contains("origin down")));

        let status = registry.status().await;
        let task = &status["bulk-download"];
        assert!(task.enabled);
        assert!(!task.running);
        assert!(task.next_run.is_some());
        assert!(task.last_error.as_deref().unwrap().contains("origin down"));

        // Still triggerable after a failure.
        assert!(matches!(
            registry.trigger("bulk-download").await.unwrap(),
            TriggerOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_clears() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register("health-check", "0 */6 * * *", counting_handler(counter))
            .await
            .unwrap();

        registry.start().await;
        registry.start().await;
        assert!(registry.is_started().await);

        registry.stop().await;
        assert!(!registry.is_started().await);
        assert!(registry.status().await.is_empty());
    }

    fn blocking_handler(release: Arc<Notify>, calls: Arc<AtomicUsize>) -> TaskHandler {
        handler(move || {
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_restart_keeps_in_flight_run_exclusive() {
        let registry = TaskRegistry::new(chrono_tz::UTC);
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "daily-update",
                "0 3 * * *",
                blocking_handler(Arc::clone(&release), Arc::clone(&calls)),
            )
            .await
            .unwrap();

        let first = registry
            .trigger_detached("daily-update")
            .await
            .unwrap()
            .unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        registry.stop().await;
        registry
            .register(
                "daily-update",
                "0 3 * * *",
                blocking_handler(Arc::clone(&release), Arc::clone(&calls)),
            )
            .await
            .unwrap();
        registry.start().await;

        assert!(registry.status().await["daily-update"].running);
        assert_eq!(
            registry.trigger("daily-update").await.unwrap(),
            TriggerOutcome::Skipped
        );
        assert!(registry
            .fire_due(Utc::now() + chrono::Duration::days(2))
            .await
            .is_empty());

        release.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.status().await["daily-update"].running);
        registry.stop().await;
    }

    /// Wall-clock time that follows tokio's (possibly paused) clock.
    fn tokio_clock(base: DateTime<Utc>) -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || base + chrono::Duration::from_std(origin.elapsed()).unwrap())
    }

    fn signalling_handler(tx: mpsc::UnboundedSender<DateTime<Utc>>, clock: Clock) -> TaskHandler {
        handler(move || {
            let tx = tx.clone();
            let clock = Arc::clone(&clock);
            async move {
                let _ = tx.send(clock());
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_fires_due_task() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 2, 59, 30).unwrap();
        let clock = tokio_clock(base);
        let registry = TaskRegistry::with_clock(chrono_tz::UTC, Arc::clone(&clock));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register("daily-update", "0 3 * * *", signalling_handler(tx, Arc::clone(&clock)))
            .await
            .unwrap();
        registry.start().await;

        let fired_at = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let due = Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        assert!(fired_at >= due && fired_at < due + chrono::Duration::seconds(1));

        // Re-armed for the following day.
        while registry.status().await["daily-update"].last_run.is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            registry.status().await["daily-update"].next_run,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 0, 0).unwrap())
        );
        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_rearms_when_task_enabled() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 10).unwrap();
        let clock = tokio_clock(base);
        let registry = TaskRegistry::with_clock(chrono_tz::UTC, Arc::clone(&clock));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register("health-check", "* * * * *", signalling_handler(tx, Arc::clone(&clock)))
            .await
            .unwrap();
        registry.set_enabled("health-check", false).await.unwrap();

        // Nothing armed: the dispatcher goes idle for much longer than a minute.
        registry.start().await;
        assert!(tokio::time::timeout(Duration::from_secs(300), rx.recv())
            .await
            .is_err());

        registry.set_enabled("health-check", true).await.unwrap();
        let fired_at = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let due = Utc.with_ymd_and_hms(2026, 1, 1, 12, 6, 0).unwrap();
        assert!(fired_at >= due && fired_at < due + chrono::Duration::seconds(1));
        registry.stop().await;
    }
}
