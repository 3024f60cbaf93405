use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::error::task_not_found;
use crate::models::{
    CoreResult, CreateTask, SessionKey, TASKS_TABLE, Task, TaskStats, TaskStatus, TaskUpdate,
    clamp_progress, now_millis,
};
use crate::persistence::{Example, RecordStore};

/// Optional constraints for listing a session's tasks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Example over the `tasks` table, always pinned to `session`.
    pub fn to_example(&self, session: &SessionKey) -> Example {
        let mut example = Example::new();
        if let Some(status) = self.status {
            example = example.with("status", status.as_str());
        }
        if let Some(name) = &self.name {
            example = example.with("name", name.as_str());
        }
        if let Some(user_id) = &self.user_id {
            example = example.with("userId", user_id.as_str());
        }
        if let Some(metadata) = &self.metadata {
            example = example.with("metadata", Value::Object(metadata.clone()));
        }
        example.with("sessionKey", session.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionLimits {
    pub max_completed_tasks: usize,
    pub max_failed_tasks: usize,
}

/// Session-scoped task CRUD and status transitions over a session's store.
///
/// Every lookup checks the stored `sessionKey`; a task owned by another
/// session is reported exactly like a missing one.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskRegistry;

impl TaskRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn create_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        request: CreateTask,
    ) -> CoreResult<Task> {
        let now = now_millis();
        let task = Task {
            id: store.generate_id(),
            name: request.name,
            description: request.description,
            status: TaskStatus::Pending,
            progress: 0.0,
            current_step: None,
            current_step_description: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            metadata: request.metadata,
            session_key: session.as_str().to_string(),
            user_id: request.user_id,
            ip_address: request.ip_address,
        };

        let stored = self.save(store, &task)?;
        tracing::debug!(session = %session, task_id = %stored.id, "created task");
        Ok(stored)
    }

    pub fn get_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
    ) -> CoreResult<Task> {
        self.owned_task(store, session, task_id)
    }

    /// Tasks of `session` matching `filter`, oldest first.
    pub fn get_tasks(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        filter: &TaskFilter,
    ) -> CoreResult<Vec<Task>> {
        let records = store.find_all_by_example(TASKS_TABLE, &filter.to_example(session))?;
        let mut tasks: Vec<Task> = records
            .iter()
            .filter_map(|record| match Task::from_record(record) {
                Ok(task) => Some(task),
                Err(error) => {
                    tracing::warn!(
                        session = %session,
                        record_id = %record.id,
                        message = %error.message,
                        "skipping undecodable task record"
                    );
                    None
                }
            })
            .collect();
        tasks.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(tasks)
    }

    pub fn update_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
        update: TaskUpdate,
    ) -> CoreResult<Task> {
        let status = update.status;
        let progress = update.progress;
        let stored = self.modify_owned(store, session, task_id, |task| {
            apply_update(task, update, now_millis());
        })?;
        tracing::debug!(
            session = %session,
            task_id = %task_id,
            status = ?status,
            progress = ?progress,
            "updated task"
        );
        Ok(stored)
    }

    /// Moves a pending or running task to `cancelled`; any other task is returned unchanged.
    pub fn cancel_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
    ) -> CoreResult<Task> {
        let mut cancelled = false;
        let stored = self.modify_owned(store, session, task_id, |task| {
            if task.status.is_cancellable() {
                task.status = TaskStatus::Cancelled;
                task.updated_at = now_millis();
                cancelled = true;
            }
        })?;
        if cancelled {
            tracing::debug!(session = %session, task_id = %task_id, "cancelled task");
        }
        Ok(stored)
    }

    /// Resets a failed or cancelled task to `pending`; any other task is returned unchanged.
    pub fn retry_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
    ) -> CoreResult<Task> {
        let mut retried = false;
        let stored = self.modify_owned(store, session, task_id, |task| {
            if task.status.is_retryable() {
                task.status = TaskStatus::Pending;
                task.progress = 0.0;
                task.error = None;
                task.started_at = None;
                task.completed_at = None;
                task.updated_at = now_millis();
                retried = true;
            }
        })?;
        if retried {
            tracing::debug!(session = %session, task_id = %task_id, "retried task");
        }
        Ok(stored)
    }

    pub fn delete_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
    ) -> CoreResult<Task> {
        let task = self.owned_task(store, session, task_id)?;
        store.delete_by_id(TASKS_TABLE, task_id)?;
        tracing::debug!(session = %session, task_id = %task_id, "deleted task");
        Ok(task)
    }

    pub fn task_stats(&self, store: &dyn RecordStore, session: &SessionKey) -> CoreResult<TaskStats> {
        let mut stats = TaskStats::default();
        for task in self.get_tasks(store, session, &TaskFilter::default())? {
            stats.record(task.status);
        }
        Ok(stats)
    }

    /// Keeps the newest `max_completed_tasks` completed tasks (by `completedAt`)
    /// and the newest `max_failed_tasks` failed tasks (by `updatedAt`), deleting
    /// the rest. Returns how many were deleted.
    pub fn cleanup_session_tasks(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        limits: RetentionLimits,
    ) -> CoreResult<usize> {
        let tasks = self.get_tasks(store, session, &TaskFilter::default())?;

        let mut completed: Vec<&Task> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .collect();
        completed.sort_by_key(|task| (Reverse(task.completed_at), Reverse(task.updated_at)));

        let mut failed: Vec<&Task> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .collect();
        failed.sort_by_key(|task| Reverse(task.updated_at));

        let mut removed = 0;
        let expired = completed
            .iter()
            .skip(limits.max_completed_tasks)
            .chain(failed.iter().skip(limits.max_failed_tasks));
        for task in expired {
            if store.delete_by_id(TASKS_TABLE, &task.id)?.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(session = %session, count = removed, "cleaned up old tasks");
        }
        Ok(removed)
    }
}

impl TaskRegistry {
    fn owned_task(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
    ) -> CoreResult<Task> {
        let record = store
            .find_by_id(TASKS_TABLE, task_id)?
            .ok_or_else(|| task_not_found(session.as_str(), task_id))?;
        let task = Task::from_record(&record)?;
        if task.session_key != session.as_str() {
            return Err(task_not_found(session.as_str(), task_id));
        }
        Ok(task)
    }

    /// Applies `change` to an owned task with the store lock held across the
    /// read and the write. A task deleted in the meantime stays deleted.
    fn modify_owned<F>(
        &self,
        store: &dyn RecordStore,
        session: &SessionKey,
        task_id: &str,
        change: F,
    ) -> CoreResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut change = Some(change);
        let stored = store.update_by_id(TASKS_TABLE, task_id, &mut |record| {
            let mut task = Task::from_record(record)?;
            if task.session_key != session.as_str() {
                return Err(task_not_found(session.as_str(), task_id));
            }
            if let Some(change) = change.take() {
                change(&mut task);
            }
            *record = task.to_record()?;
            Ok(())
        })?;

        match stored {
            Some(record) => Task::from_record(&record),
            None => Err(task_not_found(session.as_str(), task_id)),
        }
    }

    fn save(&self, store: &dyn RecordStore, task: &Task) -> CoreResult<Task> {
        let stored = store.create_or_update(TASKS_TABLE, task.to_record()?)?;
        Task::from_record(&stored)
    }
}

/// Merges `update` into `task`. `startedAt` and `completedAt` are stamped on the
/// first transition into `running` or `completed` and never overwritten.
pub(crate) fn apply_update(task: &mut Task, update: TaskUpdate, now: i64) {
    if let Some(status) = update.status {
        task.status = status;
        match status {
            TaskStatus::Running if task.started_at.is_none() => task.started_at = Some(now),
            TaskStatus::Completed if task.completed_at.is_none() => task.completed_at = Some(now),
            _ => {}
        }
    }
    if let Some(progress) = update.progress {
        task.progress = clamp_progress(progress);
    }
    if let Some(step) = update.current_step {
        task.current_step = Some(step);
    }
    if let Some(description) = update.current_step_description {
        task.current_step_description = Some(description);
    }
    if let Some(error) = update.error {
        task.error = Some(error);
    }
    if let Some(metadata) = update.metadata {
        task.metadata
            .get_or_insert_with(Map::new)
            .extend(metadata);
    }
    task.updated_at = now;
}
