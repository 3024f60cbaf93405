use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::now_millis;
use crate::orchestration::{RetentionLimits, TaskRegistry};
use crate::session::SessionStoreFactory;

pub const DEFAULT_MAX_COMPLETED_TASKS: usize = 50;
pub const DEFAULT_MAX_FAILED_TASKS: usize = 20;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 5 * 60 * 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionOptions {
    pub max_completed_tasks: usize,
    pub max_failed_tasks: usize,
    #[serde(rename = "cleanupInterval")]
    pub cleanup_interval_ms: u64,
}

impl RetentionOptions {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    pub fn limits(&self) -> RetentionLimits {
        RetentionLimits {
            max_completed_tasks: self.max_completed_tasks,
            max_failed_tasks: self.max_failed_tasks,
        }
    }
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            max_completed_tasks: DEFAULT_MAX_COMPLETED_TASKS,
            max_failed_tasks: DEFAULT_MAX_FAILED_TASKS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionOptionsUpdate {
    #[serde(default)]
    pub max_completed_tasks: Option<usize>,
    #[serde(default)]
    pub max_failed_tasks: Option<usize>,
    #[serde(default, rename = "cleanupInterval")]
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub finished_at: i64,
    pub sessions_scanned: usize,
    pub sessions_expired: usize,
    pub tasks_removed: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweeperStatus {
    pub is_running: bool,
    pub is_active: bool,
    pub options: RetentionOptions,
    pub last_run: Option<SweepReport>,
}

struct SweeperInner {
    factory: Arc<SessionStoreFactory>,
    registry: TaskRegistry,
    options: Mutex<RetentionOptions>,
    in_progress: AtomicBool,
    last_run: Mutex<Option<SweepReport>>,
}

struct SweepTimer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically expires idle sessions and trims finished tasks in every live session.
pub struct TaskRetentionSweeper {
    inner: Arc<SweeperInner>,
    timer: Mutex<Option<SweepTimer>>,
}

impl TaskRetentionSweeper {
    pub fn new(
        factory: Arc<SessionStoreFactory>,
        registry: TaskRegistry,
        options: RetentionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SweeperInner {
                factory,
                registry,
                options: Mutex::new(options),
                in_progress: AtomicBool::new(false),
                last_run: Mutex::new(None),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Starts the periodic timer on the current tokio runtime. Returns `false`
    /// when the timer is already running.
    pub fn start(&self) -> bool {
        let mut timer = lock(&self.timer);
        if timer.as_ref().is_some_and(|active| !active.handle.is_finished()) {
            tracing::warn!("task cleanup service is already running");
            return false;
        }

        let period = self.inner.options().cleanup_interval();
        let inner = self.inner.clone();
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        inner.run_cleanup();
                    }
                }
            }
        });

        *timer = Some(SweepTimer { stop, handle });
        tracing::info!(interval_ms = period.as_millis() as u64, "started task cleanup service");
        true
    }

    /// Stops the timer. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let Some(active) = lock(&self.timer).take() else {
            return false;
        };
        if active.stop.send(()).is_err() {
            active.handle.abort();
        }
        tracing::info!("stopped task cleanup service");
        true
    }

    /// One cleanup cycle; returns the number of tasks removed. A call made
    /// while another cycle is in progress does nothing and returns 0.
    pub fn run_cleanup(&self) -> usize {
        self.inner.run_cleanup()
    }

    pub fn update_options(&self, update: RetentionOptionsUpdate) -> RetentionOptions {
        let mut options = lock(&self.inner.options);
        if let Some(max_completed_tasks) = update.max_completed_tasks {
            options.max_completed_tasks = max_completed_tasks;
        }
        if let Some(max_failed_tasks) = update.max_failed_tasks {
            options.max_failed_tasks = max_failed_tasks;
        }
        if let Some(cleanup_interval_ms) = update.cleanup_interval_ms {
            options.cleanup_interval_ms = cleanup_interval_ms;
        }
        let updated = *options;
        tracing::info!(options = ?updated, "updated task cleanup options");
        updated
    }

    pub fn status(&self) -> SweeperStatus {
        let is_active = lock(&self.timer)
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished());
        SweeperStatus {
            is_running: self.inner.in_progress.load(Ordering::SeqCst),
            is_active,
            options: self.inner.options(),
            last_run: *lock(&self.inner.last_run),
        }
    }
}

impl Drop for TaskRetentionSweeper {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.timer).take() {
            active.handle.abort();
        }
    }
}

impl SweeperInner {
    fn options(&self) -> RetentionOptions {
        *lock(&self.options)
    }

    fn run_cleanup(&self) -> usize {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("cleanup already in progress, skipping");
            return 0;
        }
        let _in_progress = InProgress(&self.in_progress);

        let limits = self.options().limits();
        let sessions_expired = self.factory.cleanup_expired_sessions().unwrap_or_else(|error| {
            tracing::error!(message = %error.message, "failed to expire idle sessions");
            0
        });
        let sessions = self.factory.active_sessions().unwrap_or_else(|error| {
            tracing::error!(message = %error.message, "failed to list active sessions");
            Vec::new()
        });

        let mut tasks_removed = 0;
        for session in &sessions {
            let cleaned = self
                .factory
                .existing_database(session.as_str())
                .and_then(|database| match database {
                    Some(database) => self.registry.cleanup_session_tasks(
                        database.store.as_ref(),
                        &database.key,
                        limits,
                    ),
                    None => Ok(0),
                });
            match cleaned {
                Ok(count) => tasks_removed += count,
                Err(error) => tracing::error!(
                    session = %session,
                    kind = ?error.kind,
                    message = %error.message,
                    "error cleaning up tasks for session"
                ),
            }
        }

        tracing::info!(
            tasks_removed,
            sessions = sessions.len(),
            sessions_expired,
            "task cleanup cycle completed"
        );
        *lock(&self.last_run) = Some(SweepReport {
            finished_at: now_millis(),
            sessions_scanned: sessions.len(),
            sessions_expired,
            tasks_removed,
        });
        tasks_removed
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use std::sync::atomic::Ordering;

    use super::{RetentionOptions, RetentionOptionsUpdate, TaskRetentionSweeper};
    use crate::models::{CreateTask, TaskStatus, TaskUpdate};
    use crate::orchestration::TaskRegistry;
    use crate::session::{SessionFactoryConfig, SessionStoreFactory};

    fn sweeper(interval_ms: u64) -> TaskRetentionSweeper {
        let factory = Arc::new(SessionStoreFactory::new(SessionFactoryConfig::default()).unwrap());
        TaskRetentionSweeper::new(
            factory,
            TaskRegistry::new(),
            RetentionOptions {
                cleanup_interval_ms: interval_ms,
                ..RetentionOptions::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_deactivates() {
        let sweeper = sweeper(1_000);
        assert!(sweeper.start());
        assert!(!sweeper.start());
        assert!(sweeper.status().is_active);

        assert!(sweeper.stop());
        assert!(!sweeper.stop());
        assert!(!sweeper.status().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_cleanup_each_interval() {
        let sweeper = sweeper(1_000);
        sweeper.start();
        assert!(sweeper.status().last_run.is_none());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let last_run = sweeper.status().last_run.expect("expected a completed cycle");
        assert_eq!(last_run.tasks_removed, 0);

        sweeper.stop();
    }

    #[test]
    fn overlapping_cycle_does_nothing() {
        let factory = Arc::new(SessionStoreFactory::new(SessionFactoryConfig::default()).unwrap());
        let registry = TaskRegistry::new();
        let database = factory.get_database("s1").unwrap();
        for name in ["a", "b", "c"] {
            let task = registry
                .create_task(database.store.as_ref(), &database.key, CreateTask::named(name))
                .unwrap();
            registry
                .update_task(
                    database.store.as_ref(),
                    &database.key,
                    &task.id,
                    TaskUpdate::status(TaskStatus::Completed),
                )
                .unwrap();
        }
        let sweeper = TaskRetentionSweeper::new(
            factory,
            registry,
            RetentionOptions {
                max_completed_tasks: 1,
                ..RetentionOptions::default()
            },
        );

        sweeper.inner.in_progress.store(true, Ordering::SeqCst);
        assert!(sweeper.status().is_running);
        assert_eq!(sweeper.run_cleanup(), 0);
        assert!(sweeper.status().last_run.is_none());
        assert_eq!(
            registry
                .task_stats(database.store.as_ref(), &database.key)
                .unwrap()
                .completed,
            3
        );

        sweeper.inner.in_progress.store(false, Ordering::SeqCst);
        assert_eq!(sweeper.run_cleanup(), 2);
        assert!(!sweeper.status().is_running);
    }

    #[test]
    fn update_options_merges_partial_values() {
        let sweeper = sweeper(1_000);
        let updated = sweeper.update_options(RetentionOptionsUpdate {
            max_failed_tasks: Some(3),
            ..RetentionOptionsUpdate::default()
        });

        assert_eq!(updated.max_failed_tasks, 3);
        assert_eq!(updated.max_completed_tasks, RetentionOptions::default().max_completed_tasks);
        assert_eq!(sweeper.status().options, updated);
    }

    #[test]
    fn status_serializes_with_camel_case_keys() {
        let status = sweeper(1_000).status();
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["isRunning"], false);
        assert_eq!(value["isActive"], false);
        assert_eq!(value["options"]["cleanupInterval"], 1_000);
        assert!(value["lastRun"].is_null());
    }
}
