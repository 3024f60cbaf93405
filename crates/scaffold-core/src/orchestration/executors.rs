use std::time::Duration;

use async_trait::async_trait;

use crate::models::{CoreError, CoreErrorKind, CoreResult, Task};
use crate::orchestration::{ProgressReporter, TaskExecutor};

/// Evenly spaced steps spread over a fixed total delay.
#[derive(Clone, Debug)]
pub struct SampleExecutor {
    steps: u32,
    total_delay: Duration,
}

impl SampleExecutor {
    pub fn new(steps: u32, total_delay: Duration) -> Self {
        Self {
            steps: steps.max(1),
            total_delay,
        }
    }
}

impl Default for SampleExecutor {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

#[async_trait]
impl TaskExecutor for SampleExecutor {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> CoreResult<()> {
        tracing::info!(task_id = %task.id, name = %task.name, "starting sample task");
        let step_delay = self.total_delay / self.steps;

        for index in 0..=self.steps {
            if progress.is_cancelled() {
                return Err(CoreError::new(CoreErrorKind::Cancelled, "sample task cancelled")
                    .with_task(task.id.clone()));
            }

            let percent = f64::from(index) * 100.0 / f64::from(self.steps);
            let step = format!("Step {}", index + 1);
            let description = format!("Processing iteration {} of {}", index + 1, self.steps);
            progress.report(percent.round(), Some(&step), Some(&description));

            if index < self.steps {
                tokio::time::sleep(step_delay).await;
            }
        }

        tracing::info!(task_id = %task.id, name = %task.name, "completed sample task");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedStep {
    pub name: String,
    pub description: String,
    pub progress: f64,
}

impl PlannedStep {
    pub fn new(name: impl Into<String>, progress: f64, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            progress,
        }
    }
}

/// Walks a fixed list of named steps, pausing after each one.
#[derive(Clone, Debug)]
pub struct StepPlanExecutor {
    steps: Vec<PlannedStep>,
    pause: Duration,
}

impl StepPlanExecutor {
    pub fn new(steps: Vec<PlannedStep>, pause: Duration) -> Self {
        Self { steps, pause }
    }

    pub fn file_processing(path: &str, pause: Duration) -> Self {
        Self::new(
            vec![
                PlannedStep::new(
                    "Validating file",
                    10.0,
                    format!("Checking file format and integrity for {path}"),
                ),
                PlannedStep::new(
                    "Reading file content",
                    25.0,
                    "Loading file contents into memory for processing",
                ),
                PlannedStep::new("Processing data", 50.0, "Analyzing and transforming file data"),
                PlannedStep::new(
                    "Transforming content",
                    75.0,
                    "Converting data to required output format",
                ),
                PlannedStep::new(
                    "Saving results",
                    90.0,
                    "Writing processed results to output location",
                ),
                PlannedStep::new("Finalizing", 100.0, "Completing cleanup and verification"),
            ],
            pause,
        )
    }

    pub fn api_call(endpoint: &str, pause: Duration) -> Self {
        Self::new(
            vec![
                PlannedStep::new(
                    "Preparing Request",
                    20.0,
                    format!("Building request payload for {endpoint}"),
                ),
                PlannedStep::new(
                    "Sending Request",
                    40.0,
                    "Transmitting data to remote API endpoint",
                ),
                PlannedStep::new(
                    "Processing Response",
                    60.0,
                    "Receiving and parsing API response",
                ),
                PlannedStep::new(
                    "Validating Data",
                    80.0,
                    "Checking response data integrity and format",
                ),
                PlannedStep::new("Completed", 100.0, "API call successfully completed"),
            ],
            pause,
        )
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }
}

#[async_trait]
impl TaskExecutor for StepPlanExecutor {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> CoreResult<()> {
        for step in &self.steps {
            if progress.is_cancelled() {
                return Err(CoreError::new(CoreErrorKind::Cancelled, "step plan cancelled")
                    .with_task(task.id.clone()));
            }
            tracing::debug!(task_id = %task.id, step = %step.name, "running planned step");
            progress.report(step.progress, Some(&step.name), Some(&step.description));
            tokio::time::sleep(self.pause).await;
        }
        Ok(())
    }
}

/// Reports some progress, then fails with the configured message.
#[derive(Clone, Debug)]
pub struct FailingExecutor {
    progress_before_failure: f64,
    message: String,
}

impl FailingExecutor {
    pub fn new(progress_before_failure: f64, message: impl Into<String>) -> Self {
        Self {
            progress_before_failure,
            message: message.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> CoreResult<()> {
        progress.report(self.progress_before_failure, Some("Failing"), None);
        Err(
            CoreError::new(CoreErrorKind::ExecutionFailure, self.message.clone())
                .with_task(task.id.clone()),
        )
    }
}
