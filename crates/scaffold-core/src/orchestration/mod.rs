pub mod execution;
pub mod executors;
pub mod registry;
pub mod retention;

pub use execution::{
    ProgressReporter, RunningTaskKey, TaskCancellationToken, TaskExecutionCoordinator,
    TaskExecutor,
};
pub use executors::{FailingExecutor, PlannedStep, SampleExecutor, StepPlanExecutor};
pub use registry::{RetentionLimits, TaskFilter, TaskRegistry};
pub use retention::{
    RetentionOptions, RetentionOptionsUpdate, SweepReport, SweeperStatus, TaskRetentionSweeper,
};
