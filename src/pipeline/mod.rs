//! Pipeline coordinator: the four stages and their shared task machinery.
//!
//! Each stage is a pool of workers draining a claimed batch. The shared
//! contract: claim work, run the stage function under soft/hard deadlines,
//! persist result and status in one transaction, and on failure burn one
//! unit of the item's retry budget with exponential backoff. Status only
//! advances after the result is durable, so a crashed worker leaves its
//! item redeliverable.

pub mod embed_stage;
pub mod fetch;
pub mod llm_stage;
pub mod pdf_stage;
pub mod queue;
pub mod retry;
pub mod throttle;

pub use embed_stage::run_embed_batch;
pub use fetch::{run_fetch, FetchRequest, FetchStats};
pub use llm_stage::run_llm_batch;
pub use pdf_stage::run_pdf_batch;

use std::time::Duration;

use serde::Serialize;

use crate::config::Settings;
use retry::RetryPolicy;

/// Outcome counters for one batch run of a stage.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StageStats {
    /// Items taken off the queue.
    pub processed: usize,
    /// Items that finished their stage.
    pub completed: usize,
    /// Items the stage refused (duplicate, no PDF, too little text).
    pub skipped: usize,
    /// Items that failed terminally in this run.
    pub failed: usize,
}

impl StageStats {
    pub fn absorb(&mut self, other: &StageStats) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Deadlines shared by all stage tasks.
#[derive(Debug, Clone, Copy)]
pub struct TaskDeadlines {
    pub soft: Duration,
    pub hard: Duration,
}

impl TaskDeadlines {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            soft: Duration::from_secs(settings.soft_deadline_secs),
            hard: Duration::from_secs(settings.hard_deadline_secs),
        }
    }
}

/// Retry policy for stage tasks (distinct from the tighter client-level
/// policies inside the HTTP clients).
pub fn task_retry_policy(settings: &Settings) -> RetryPolicy {
    RetryPolicy::new(
        settings.max_task_retries,
        Duration::from_secs(60),
        Duration::from_secs(600),
    )
}

/// Run a future under the task deadlines: a warning when the soft deadline
/// is exceeded, an error when the hard deadline aborts the task.
pub async fn with_deadlines<T, E>(
    deadlines: TaskDeadlines,
    label: &str,
    task: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, DeadlineError<E>> {
    let started = std::time::Instant::now();
    match tokio::time::timeout(deadlines.hard, task).await {
        Ok(result) => {
            let elapsed = started.elapsed();
            if elapsed > deadlines.soft {
                tracing::warn!(
                    "{} exceeded its soft deadline ({:?} > {:?})",
                    label,
                    elapsed,
                    deadlines.soft
                );
            }
            result.map_err(DeadlineError::Task)
        }
        Err(_) => Err(DeadlineError::HardDeadline(deadlines.hard)),
    }
}

/// Either the task's own error or a hard-deadline abort.
#[derive(Debug)]
pub enum DeadlineError<E> {
    Task(E),
    HardDeadline(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for DeadlineError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadlineError::Task(e) => write!(f, "{e}"),
            DeadlineError::HardDeadline(limit) => {
                write!(f, "hard deadline of {limit:?} exceeded")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_deadlines() -> TaskDeadlines {
        TaskDeadlines {
            soft: Duration::from_millis(5),
            hard: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_with_deadlines_passes_result() {
        let result: Result<u32, DeadlineError<String>> =
            with_deadlines(quick_deadlines(), "task", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_deadlines_hard_abort() {
        let result: Result<(), DeadlineError<String>> =
            with_deadlines(quick_deadlines(), "task", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DeadlineError::HardDeadline(_))));
    }

    #[tokio::test]
    async fn test_with_deadlines_task_error() {
        let result: Result<(), DeadlineError<String>> =
            with_deadlines(quick_deadlines(), "task", async {
                Err("stage failed".to_string())
            })
            .await;
        match result {
            Err(DeadlineError::Task(message)) => assert_eq!(message, "stage failed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_stage_stats_absorb() {
        let mut total = StageStats::default();
        total.absorb(&StageStats {
            processed: 2,
            completed: 1,
            skipped: 1,
            failed: 0,
        });
        total.absorb(&StageStats {
            processed: 1,
            completed: 0,
            skipped: 0,
            failed: 1,
        });
        assert_eq!(total.processed, 3);
        assert_eq!(total.completed, 1);
        assert_eq!(total.skipped, 1);
        assert_eq!(total.failed, 1);
    }
}
