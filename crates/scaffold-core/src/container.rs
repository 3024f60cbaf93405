use std::sync::Arc;

use crate::config::ScaffoldConfig;
use crate::models::CoreResult;
use crate::orchestration::{TaskExecutionCoordinator, TaskRegistry, TaskRetentionSweeper};
use crate::session::{SessionResolver, SessionStoreFactory};

/// The long-lived components, built once from a resolved [`ScaffoldConfig`].
pub struct Services {
    pub factory: Arc<SessionStoreFactory>,
    pub registry: TaskRegistry,
    pub coordinator: Arc<TaskExecutionCoordinator>,
    pub sweeper: TaskRetentionSweeper,
    pub resolver: SessionResolver,
}

impl Services {
    pub fn from_config(config: &ScaffoldConfig) -> CoreResult<Self> {
        let factory = Arc::new(SessionStoreFactory::new(config.session_factory())?);
        let registry = TaskRegistry::new();
        let coordinator = Arc::new(TaskExecutionCoordinator::new(factory.clone(), registry));
        let sweeper = TaskRetentionSweeper::new(factory.clone(), registry, config.retention());
        let resolver = SessionResolver::new(config.resolver());

        tracing::info!(
            max_sessions = config.session.max_sessions,
            session_timeout_ms = config.session.session_timeout_ms,
            session_isolation = config.profile.session_isolation,
            full_auth = config.profile.full_auth,
            "initialized scaffold services"
        );

        Ok(Self {
            factory,
            registry,
            coordinator,
            sweeper,
            resolver,
        })
    }

    /// Starts the retention timer. Must run inside a tokio runtime.
    pub fn start_background(&self) -> bool {
        self.sweeper.start()
    }

    /// Stops the retention timer and cancels every in-flight task run.
    /// Returns how many runs were cancelled.
    pub fn shutdown(&self) -> usize {
        self.sweeper.stop();
        let cancelled = self.coordinator.cancel_all_running_tasks();
        tracing::info!(cancelled, "scaffold services shut down");
        cancelled
    }
}
