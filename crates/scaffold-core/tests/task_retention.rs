use std::sync::Arc;
use std::time::Duration;

use scaffold_core::models::{CreateTask, SessionKey, TASKS_TABLE, Task, TaskStatus, TaskUpdate};
use scaffold_core::orchestration::{
    RetentionLimits, RetentionOptions, RetentionOptionsUpdate, TaskFilter, TaskRegistry,
    TaskRetentionSweeper,
};
use scaffold_core::persistence::{KeyedStore, RecordStore};
use scaffold_core::session::{SessionFactoryConfig, SessionStoreFactory};

/// Creates a task in `status`, then rewrites its timestamps so ordering is deterministic.
fn seed_task(
    store: &KeyedStore,
    session: &SessionKey,
    status: TaskStatus,
    stamp: i64,
) -> Task {
    let registry = TaskRegistry::new();
    let task = registry
        .create_task(store, session, CreateTask::named(format!("task-{stamp}")))
        .unwrap();
    let mut task = registry
        .update_task(store, session, &task.id, TaskUpdate::status(status))
        .unwrap();

    task.updated_at = stamp;
    if status == TaskStatus::Completed {
        task.completed_at = Some(stamp);
    }
    store
        .create_or_update(TASKS_TABLE, task.to_record().unwrap())
        .unwrap();
    task
}

fn ids_with_status(store: &KeyedStore, session: &SessionKey, status: TaskStatus) -> Vec<i64> {
    let mut stamps: Vec<i64> = TaskRegistry::new()
        .get_tasks(store, session, &TaskFilter::status(status))
        .unwrap()
        .into_iter()
        .map(|task| task.updated_at)
        .collect();
    stamps.sort();
    stamps
}

#[test]
fn oldest_completed_tasks_are_trimmed() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    for stamp in 1_000..1_010 {
        seed_task(&store, &session, TaskStatus::Completed, stamp);
    }

    let removed = TaskRegistry::new()
        .cleanup_session_tasks(
            &store,
            &session,
            RetentionLimits {
                max_completed_tasks: 5,
                max_failed_tasks: 20,
            },
        )
        .unwrap();

    assert_eq!(removed, 5);
    assert_eq!(
        ids_with_status(&store, &session, TaskStatus::Completed),
        vec![1_005, 1_006, 1_007, 1_008, 1_009]
    );
}

#[test]
fn oldest_failed_tasks_are_trimmed_and_others_are_kept() {
    let store = KeyedStore::new();
    let session = SessionKey::sanitize("s1");
    for stamp in 2_000..2_010 {
        seed_task(&store, &session, TaskStatus::Failed, stamp);
    }
    seed_task(&store, &session, TaskStatus::Cancelled, 1);
    seed_task(&store, &session, TaskStatus::Running, 2);

    let removed = TaskRegistry::new()
        .cleanup_session_tasks(
            &store,
            &session,
            RetentionLimits {
                max_completed_tasks: 50,
                max_failed_tasks: 3,
            },
        )
        .unwrap();

    assert_eq!(removed, 7);
    assert_eq!(
        ids_with_status(&store, &session, TaskStatus::Failed),
        vec![2_007, 2_008, 2_009]
    );
    let stats = TaskRegistry::new().task_stats(&store, &session).unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.running, 1);
}

#[test]
fn cleanup_only_touches_the_given_session() {
    let store = KeyedStore::new();
    let mine = SessionKey::sanitize("mine");
    let theirs = SessionKey::sanitize("theirs");
    for stamp in 0..4 {
        seed_task(&store, &mine, TaskStatus::Completed, stamp);
        seed_task(&store, &theirs, TaskStatus::Completed, stamp);
    }

    let removed = TaskRegistry::new()
        .cleanup_session_tasks(
            &store,
            &mine,
            RetentionLimits {
                max_completed_tasks: 1,
                max_failed_tasks: 1,
            },
        )
        .unwrap();

    assert_eq!(removed, 3);
    assert_eq!(ids_with_status(&store, &theirs, TaskStatus::Completed).len(), 4);
}

#[test]
fn sweeper_trims_every_live_session() {
    let factory = Arc::new(SessionStoreFactory::new(SessionFactoryConfig::default()).unwrap());
    for session in ["alpha", "beta"] {
        let database = factory.get_database(session).unwrap();
        for stamp in 0..3 {
            seed_task(&database.store, &database.key, TaskStatus::Completed, stamp);
        }
    }

    let sweeper = TaskRetentionSweeper::new(
        factory.clone(),
        TaskRegistry::new(),
        RetentionOptions {
            max_completed_tasks: 1,
            ..RetentionOptions::default()
        },
    );

    assert_eq!(sweeper.run_cleanup(), 4);
    let report = sweeper.status().last_run.unwrap();
    assert_eq!(report.sessions_scanned, 2);
    assert_eq!(report.tasks_removed, 4);
    assert_eq!(sweeper.run_cleanup(), 0);
}

#[tokio::test]
async fn sweeper_expires_idle_sessions_first() {
    let factory = Arc::new(
        SessionStoreFactory::new(SessionFactoryConfig {
            session_timeout: Duration::from_millis(50),
            ..SessionFactoryConfig::default()
        })
        .unwrap(),
    );
    let idle = factory.get_database("idle").unwrap();
    seed_task(&idle.store, &idle.key, TaskStatus::Completed, 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let sweeper = TaskRetentionSweeper::new(
        factory.clone(),
        TaskRegistry::new(),
        RetentionOptions::default(),
    );
    sweeper.run_cleanup();

    let report = sweeper.status().last_run.unwrap();
    assert_eq!(report.sessions_expired, 1);
    assert_eq!(report.sessions_scanned, 0);
    assert!(factory.active_sessions().unwrap().is_empty());
}

#[test]
fn updated_limits_apply_to_the_next_cycle() {
    let factory = Arc::new(SessionStoreFactory::new(SessionFactoryConfig::default()).unwrap());
    let database = factory.get_database("s1").unwrap();
    for stamp in 0..4 {
        seed_task(&database.store, &database.key, TaskStatus::Failed, stamp);
    }

    let sweeper = TaskRetentionSweeper::new(
        factory.clone(),
        TaskRegistry::new(),
        RetentionOptions::default(),
    );
    assert_eq!(sweeper.run_cleanup(), 0);

    sweeper.update_options(RetentionOptionsUpdate {
        max_failed_tasks: Some(1),
        ..RetentionOptionsUpdate::default()
    });
    assert_eq!(sweeper.run_cleanup(), 3);
}
