use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, SessionKey, Task, TaskStatus, TaskUpdate,
};
use crate::orchestration::TaskRegistry;
use crate::session::SessionStoreFactory;

/// Work behind a task. Implementations report progress through the reporter
/// and return once the work is done; an `Err` marks the task failed.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> CoreResult<()>;
}

#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    flag: Arc<AtomicBool>,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &TaskCancellationToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTaskKey {
    pub session_key: SessionKey,
    pub task_id: String,
}

impl RunningTaskKey {
    pub fn new(session: &SessionKey, task_id: &str) -> Self {
        Self {
            session_key: session.clone(),
            task_id: task_id.to_string(),
        }
    }
}

type RunningSet = HashMap<RunningTaskKey, TaskCancellationToken>;

/// Progress callback handed to a [`TaskExecutor`].
///
/// Once the run is cancelled, reports are dropped instead of persisted. The
/// check and the write share the running-set lock with cancellation.
pub struct ProgressReporter {
    factory: Arc<SessionStoreFactory>,
    registry: TaskRegistry,
    running: Arc<Mutex<RunningSet>>,
    session: SessionKey,
    task_id: String,
    token: TaskCancellationToken,
}

impl ProgressReporter {
    pub fn report(&self, progress: f64, step: Option<&str>, description: Option<&str>) {
        let _running = lock_running(&self.running);
        if self.token.is_cancelled() {
            tracing::debug!(
                session = %self.session,
                task_id = %self.task_id,
                progress,
                "dropping progress report for cancelled run"
            );
            return;
        }

        let update = TaskUpdate {
            progress: Some(progress),
            current_step: step.map(str::to_string),
            current_step_description: description.map(str::to_string),
            ..TaskUpdate::default()
        };
        if let Err(error) = write_update(
            &self.factory,
            self.registry,
            &self.session,
            &self.task_id,
            update,
        ) {
            tracing::error!(
                session = %self.session,
                task_id = %self.task_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to persist task progress"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Drives task executors, allowing at most one run per `(session, task)` pair.
///
/// Terminal writes and cancellations are serialized on the running-set lock,
/// so a cancelled run never lands in `completed` or `failed` afterwards.
pub struct TaskExecutionCoordinator {
    factory: Arc<SessionStoreFactory>,
    registry: TaskRegistry,
    running: Arc<Mutex<RunningSet>>,
}

impl TaskExecutionCoordinator {
    pub fn new(factory: Arc<SessionStoreFactory>, registry: TaskRegistry) -> Self {
        Self {
            factory,
            registry,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn execute_task(
        &self,
        session: &SessionKey,
        task_id: &str,
        executor: Arc<dyn TaskExecutor>,
    ) {
        let key = RunningTaskKey::new(session, task_id);
        let token = TaskCancellationToken::new();
        {
            let mut running = self.lock_running();
            if running.contains_key(&key) {
                tracing::warn!(session = %session, task_id = %task_id, "task is already running");
                return;
            }
            running.insert(key.clone(), token.clone());
        }
        let mut marker = RunningMarker {
            coordinator: self,
            key,
            token: token.clone(),
            armed: true,
        };

        let outcome = self.run(session, task_id, executor, &token).await;
        marker.armed = false;
        self.finish(&marker.key, &token, outcome);
    }

    /// Runs [`execute_task`](Self::execute_task) on the tokio runtime.
    pub fn spawn_task(
        self: &Arc<Self>,
        session: SessionKey,
        task_id: String,
        executor: Arc<dyn TaskExecutor>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.execute_task(&session, &task_id, executor).await;
        })
    }

    pub fn is_task_running(&self, session: &SessionKey, task_id: &str) -> bool {
        self.lock_running()
            .contains_key(&RunningTaskKey::new(session, task_id))
    }

    pub fn running_tasks(&self) -> Vec<RunningTaskKey> {
        let mut keys: Vec<RunningTaskKey> = self.lock_running().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stops tracking a running task and marks it cancelled. The executor is
    /// not preempted; its later progress reports are dropped. Returns whether
    /// the task was running.
    pub fn cancel_running_task(&self, session: &SessionKey, task_id: &str) -> bool {
        let mut running = self.lock_running();
        let Some(token) = running.remove(&RunningTaskKey::new(session, task_id)) else {
            return false;
        };
        token.cancel();

        if let Err(error) = write_update(
            &self.factory,
            self.registry,
            session,
            task_id,
            TaskUpdate::status(TaskStatus::Cancelled),
        ) {
            tracing::error!(
                session = %session,
                task_id = %task_id,
                message = %error.message,
                "failed to mark running task cancelled"
            );
        }
        tracing::info!(session = %session, task_id = %task_id, "cancelled running task");
        true
    }

    pub fn cancel_all_running_tasks(&self) -> usize {
        let cancelled = self
            .running_tasks()
            .iter()
            .filter(|key| self.cancel_running_task(&key.session_key, &key.task_id))
            .count();
        tracing::info!(count = cancelled, "cancelled all running tasks");
        cancelled
    }
}

impl TaskExecutionCoordinator {
    async fn run(
        &self,
        session: &SessionKey,
        task_id: &str,
        executor: Arc<dyn TaskExecutor>,
        token: &TaskCancellationToken,
    ) -> CoreResult<()> {
        let task = {
            let _running = self.lock_running();
            if token.is_cancelled() {
                return Ok(());
            }
            let database = self.factory.get_database(session.as_str())?;
            self.registry.update_task(
                database.store.as_ref(),
                &database.key,
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Running),
                    progress: Some(0.0),
                    ..TaskUpdate::default()
                },
            )?
        };
        tracing::info!(session = %session, task_id = %task_id, "starting task execution");

        let reporter = ProgressReporter {
            factory: self.factory.clone(),
            registry: self.registry,
            running: self.running.clone(),
            session: session.clone(),
            task_id: task_id.to_string(),
            token: token.clone(),
        };
        let handle = tokio::spawn(async move { executor.execute(&task, &reporter).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(CoreError::new(
                CoreErrorKind::ExecutionFailure,
                format!("task executor aborted: {join_error}"),
            )),
        }
    }

    fn finish(&self, key: &RunningTaskKey, token: &TaskCancellationToken, outcome: CoreResult<()>) {
        let mut running = self.lock_running();
        if running
            .get(key)
            .is_some_and(|current| current.same_as(token))
        {
            running.remove(key);
        }

        let session = &key.session_key;
        let task_id = key.task_id.as_str();
        if token.is_cancelled() {
            tracing::info!(session = %session, task_id = %task_id, "task run ended after cancellation");
            return;
        }

        let update = match outcome {
            Ok(()) => {
                tracing::info!(session = %session, task_id = %task_id, "completed task execution");
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100.0),
                    ..TaskUpdate::default()
                }
            }
            Err(error) => {
                tracing::error!(
                    session = %session,
                    task_id = %task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "task execution failed"
                );
                TaskUpdate {
                    status: Some(TaskStatus::Failed),
                    error: Some(error.message),
                    ..TaskUpdate::default()
                }
            }
        };

        if let Err(error) = write_update(&self.factory, self.registry, session, task_id, update) {
            tracing::warn!(
                session = %session,
                task_id = %task_id,
                message = %error.message,
                "could not record final task state"
            );
        }
    }

    fn release(&self, key: &RunningTaskKey, token: &TaskCancellationToken) {
        let mut running = self.lock_running();
        if running
            .get(key)
            .is_some_and(|current| current.same_as(token))
        {
            running.remove(key);
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, RunningSet> {
        lock_running(&self.running)
    }
}

/// Clears the running marker if an `execute_task` future is dropped mid-run.
struct RunningMarker<'a> {
    coordinator: &'a TaskExecutionCoordinator,
    key: RunningTaskKey,
    token: TaskCancellationToken,
    armed: bool,
}

impl Drop for RunningMarker<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.release(&self.key, &self.token);
        }
    }
}

fn lock_running(running: &Mutex<RunningSet>) -> MutexGuard<'_, RunningSet> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_update(
    factory: &SessionStoreFactory,
    registry: TaskRegistry,
    session: &SessionKey,
    task_id: &str,
    update: TaskUpdate,
) -> CoreResult<Task> {
    let database = factory.get_database(session.as_str())?;
    registry.update_task(database.store.as_ref(), &database.key, task_id, update)
}
