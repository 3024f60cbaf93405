use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    InvalidInput,
    StorageFailure,
    ExecutionFailure,
    Cancelled,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub session: Option<String>,
    pub task: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            session: None,
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Status code the route layer answers with when this error reaches it.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            CoreErrorKind::NotFound => 404,
            CoreErrorKind::InvalidInput => 400,
            _ => 500,
        }
    }
}

pub(crate) fn task_not_found(session: &str, task_id: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("task '{task_id}' not found"),
    )
    .with_session(session)
    .with_task(task_id)
}

pub(crate) fn poisoned(component: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::Internal,
        format!("{component} mutex poisoned"),
    )
}
