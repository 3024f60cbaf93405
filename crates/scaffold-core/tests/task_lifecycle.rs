use serde_json::{Map, Value, json};

use scaffold_core::models::{CoreErrorKind, CreateTask, SessionKey, TaskStatus, TaskUpdate};
use scaffold_core::orchestration::{TaskFilter, TaskRegistry};
use scaffold_core::persistence::KeyedStore;

fn metadata(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn progress_then_completion() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let registry = TaskRegistry::new();

    let task = registry
        .create_task(&store, &session, CreateTask::named("import"))
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0.0);
    assert_eq!(task.session_key, "s1");

    let halfway = registry
        .update_task(&store, &session, &task.id, TaskUpdate::progress(50.0))
        .unwrap();
    assert_eq!(halfway.progress, 50.0);

    let done = registry
        .update_task(
            &store,
            &session,
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                progress: Some(100.0),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert!(done.completed_at.is_some());
    assert_eq!(
        registry.get_task(&store, &session, &task.id).unwrap(),
        done
    );
}

#[test]
fn tasks_of_another_session_look_missing() {
    let store = KeyedStore::new();
    let owner = SessionKey::sanitize("s1");
    let stranger = SessionKey::sanitize("s2");
    let registry = TaskRegistry::new();

    let task = registry
        .create_task(&store, &owner, CreateTask::named("private"))
        .unwrap();

    let lookups = [
        registry.get_task(&store, &stranger, &task.id),
        registry.update_task(&store, &stranger, &task.id, TaskUpdate::progress(10.0)),
        registry.cancel_task(&store, &stranger, &task.id),
        registry.retry_task(&store, &stranger, &task.id),
        registry.delete_task(&store, &stranger, &task.id),
    ];
    for lookup in lookups {
        let error = lookup.unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::NotFound);
        assert_eq!(error.http_status(), 404);
    }

    assert!(registry
        .get_tasks(&store, &stranger, &TaskFilter::default())
        .unwrap()
        .is_empty());
    let untouched = registry.get_task(&store, &owner, &task.id).unwrap();
    assert_eq!(untouched.progress, 0.0);
    assert_eq!(untouched.status, TaskStatus::Pending);
}

#[test]
fn missing_ids_are_not_found() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let error = TaskRegistry::new()
        .get_task(&store, &session, "does-not-exist")
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
}

#[test]
fn cancel_and_retry_only_apply_to_eligible_states() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let registry = TaskRegistry::new();

    let pending = registry
        .create_task(&store, &session, CreateTask::named("pending"))
        .unwrap();
    let retried = registry.retry_task(&store, &session, &pending.id).unwrap();
    assert_eq!(retried, pending);

    let finished = registry
        .create_task(&store, &session, CreateTask::named("finished"))
        .unwrap();
    let finished = registry
        .update_task(
            &store,
            &session,
            &finished.id,
            TaskUpdate::status(TaskStatus::Completed),
        )
        .unwrap();
    let not_cancelled = registry.cancel_task(&store, &session, &finished.id).unwrap();
    assert_eq!(not_cancelled, finished);

    let cancelled = registry.cancel_task(&store, &session, &pending.id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    let again = registry.cancel_task(&store, &session, &pending.id).unwrap();
    assert_eq!(again, cancelled);
}

#[test]
fn retry_resets_a_failed_task() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let registry = TaskRegistry::new();

    let task = registry
        .create_task(&store, &session, CreateTask::named("flaky"))
        .unwrap();
    registry
        .update_task(
            &store,
            &session,
            &task.id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                progress: Some(40.0),
                error: Some("disk full".to_string()),
                ..TaskUpdate::default()
            },
        )
        .unwrap();

    let retried = registry.retry_task(&store, &session, &task.id).unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.progress, 0.0);
    assert_eq!(retried.error, None);
}

#[test]
fn filters_combine_with_the_session_constraint() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let other = SessionKey::sanitize("s2");
    let registry = TaskRegistry::new();

    let tagged = registry
        .create_task(
            &store,
            &session,
            CreateTask {
                metadata: Some(metadata(json!({ "kind": "export", "priority": 2 }))),
                user_id: Some("u-1".to_string()),
                ..CreateTask::named("export")
            },
        )
        .unwrap();
    registry
        .create_task(&store, &session, CreateTask::named("import"))
        .unwrap();
    registry
        .create_task(
            &store,
            &other,
            CreateTask {
                metadata: Some(metadata(json!({ "kind": "export", "priority": 2 }))),
                ..CreateTask::named("export")
            },
        )
        .unwrap();

    let by_name = registry
        .get_tasks(
            &store,
            &session,
            &TaskFilter {
                name: Some("export".to_string()),
                ..TaskFilter::default()
            },
        )
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].id, tagged.id);

    let by_metadata = registry
        .get_tasks(
            &store,
            &session,
            &TaskFilter {
                metadata: Some(metadata(json!({ "kind": "export", "priority": 2 }))),
                ..TaskFilter::default()
            },
        )
        .unwrap();
    assert_eq!(by_metadata.len(), 1);

    let by_user = registry
        .get_tasks(
            &store,
            &session,
            &TaskFilter {
                user_id: Some("u-1".to_string()),
                ..TaskFilter::default()
            },
        )
        .unwrap();
    assert_eq!(by_user.len(), 1);

    let pending = registry
        .get_tasks(&store, &session, &TaskFilter::status(TaskStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 2);
}

#[test]
fn stats_count_every_status() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let registry = TaskRegistry::new();

    for status in [
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        let task = registry
            .create_task(&store, &session, CreateTask::named("job"))
            .unwrap();
        registry
            .update_task(&store, &session, &task.id, TaskUpdate::status(status))
            .unwrap();
    }
    registry
        .create_task(&store, &session, CreateTask::named("waiting"))
        .unwrap();

    let stats = registry.task_stats(&store, &session).unwrap();
    assert_eq!(stats.total, 5);
    let expected = [1, 1, 2, 1, 0];
    for (status, count) in TaskStatus::ALL.into_iter().zip(expected) {
        assert_eq!(stats.count(status), count, "{status}");
    }
    assert_eq!(
        TaskStatus::ALL.iter().map(|status| stats.count(*status)).sum::<usize>(),
        stats.total
    );
}

#[test]
fn delete_removes_the_task() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    let registry = TaskRegistry::new();

    let task = registry
        .create_task(
            &store,
            &session,
            CreateTask {
                ip_address: Some("10.0.0.7".to_string()),
                ..CreateTask::named("temporary")
            },
        )
        .unwrap();
    let deleted = registry.delete_task(&store, &session, &task.id).unwrap();
    assert_eq!(deleted.ip_address.as_deref(), Some("10.0.0.7"));

    let error = registry.get_task(&store, &session, &task.id).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    let late_update = registry
        .update_task(&store, &session, &task.id, TaskUpdate::progress(90.0))
        .unwrap_err();
    assert_eq!(late_update.kind, CoreErrorKind::NotFound);
    assert_eq!(registry.task_stats(&store, &session).unwrap().total, 0);
}
