pub mod error;
pub mod record;
pub mod session;
pub mod task;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use record::Record;
pub use session::SessionKey;
pub use task::{
    CreateTask, TASKS_TABLE, Task, TaskStats, TaskStatus, TaskUpdate, clamp_progress,
};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
