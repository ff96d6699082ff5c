//! Generic saga engine: an ordered list of steps, each with optional
//! compensation, executed with per-step retry and backoff. On a terminal
//! step failure, already-completed steps are compensated in reverse order;
//! a compensation failure is logged and does not stop the rollback.

use crate::config::RetryConfig;
use crate::error::{CoreError, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A saga step's terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStepStatus {
    /// Not yet attempted.
    Pending,
    /// Action succeeded.
    Completed,
    /// Action failed after exhausting retries.
    Failed,
    /// Compensation ran after a later step failed.
    Compensated,
}

/// A saga's overall terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are still executing.
    Executing,
    /// Every step completed.
    Completed,
    /// A step failed and every completed step's compensation succeeded.
    Compensated,
    /// A step failed with nothing to compensate (it was the first step),
    /// or with at least one compensation itself failing, leaving a
    /// partially-undone side effect that needs operator attention.
    Failed,
}

type StepAction = Box<dyn for<'a> Fn() -> BoxFuture<'a, Result<()>> + Send + Sync>;
type StepCompensation = Box<dyn for<'a> Fn() -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// One named step: an action, an optional compensation, and a retry cap.
pub struct SagaStep {
    name: String,
    action: StepAction,
    compensation: Option<StepCompensation>,
    max_retries: u32,
}

impl SagaStep {
    /// A step with no compensation: if it fails, prior steps still
    /// compensate, but this step leaves nothing to undo.
    pub fn new(
        name: impl Into<String>,
        max_retries: u32,
        action: impl for<'a> Fn() -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            compensation: None,
            max_retries,
        }
    }

    /// Attach a compensation action, run in reverse order on saga failure.
    #[must_use]
    pub fn with_compensation(
        mut self,
        compensation: impl for<'a> Fn() -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.compensation = Some(Box::new(compensation));
        self
    }
}

struct StepRecord {
    name: String,
    status: SagaStepStatus,
}

/// Snapshot of a saga's progress, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SagaSnapshot {
    /// Overall saga status.
    pub status: SagaStatus,
    /// Per-step name and status, in execution order.
    pub steps: Vec<(String, SagaStepStatus)>,
}

/// Executes an ordered list of [`SagaStep`]s with retry and compensation.
pub struct Saga {
    steps: Vec<SagaStep>,
    retry: RetryConfig,
}

impl Saga {
    /// Build a saga from an ordered list of steps.
    #[must_use]
    pub fn new(steps: Vec<SagaStep>, retry: RetryConfig) -> Self {
        Self { steps, retry }
    }

    /// Run every step in order. On a step's terminal failure (retries
    /// exhausted), compensates every completed step in reverse order and
    /// returns the original error. Compensation failures are logged and do
    /// not stop the rollback, but they do mark the saga `Failed` rather
    /// than `Compensated`: a partially-undone side effect needs operator
    /// attention, it is not a clean rollback.
    ///
    /// # Errors
    /// Returns the failing step's error (after compensation attempts, if
    /// any steps had completed).
    pub async fn run(&self) -> Result<SagaSnapshot> {
        self.run_inner(None).await
    }

    /// Like [`Saga::run`], but registers a live snapshot under `saga_id` in
    /// `registry` before starting and after every step transition, so a
    /// concurrent `GET /sagas`-style caller observes in-flight progress
    /// rather than only the terminal result.
    ///
    /// # Errors
    /// Same as [`Saga::run`].
    pub async fn run_tracked(&self, registry: &SagaRegistry, saga_id: &str) -> Result<SagaSnapshot> {
        self.run_inner(Some((registry, saga_id))).await
    }

    async fn run_inner(&self, tracking: Option<(&SagaRegistry, &str)>) -> Result<SagaSnapshot> {
        let mut records: Vec<StepRecord> = self
            .steps
            .iter()
            .map(|s| StepRecord {
                name: s.name.clone(),
                status: SagaStepStatus::Pending,
            })
            .collect();

        let publish = |status: SagaStatus, records: &[StepRecord]| {
            if let Some((registry, saga_id)) = tracking {
                registry.register(
                    saga_id,
                    SagaSnapshot {
                        status,
                        steps: records.iter().map(|r| (r.name.clone(), r.status)).collect(),
                    },
                );
            }
        };
        publish(SagaStatus::Executing, &records);

        for (index, step) in self.steps.iter().enumerate() {
            tracing::info!(step = %step.name, "saga step starting");
            match self.run_step_with_retry(step).await {
                Ok(()) => {
                    records[index].status = SagaStepStatus::Completed;
                    tracing::info!(step = %step.name, "saga step completed");
                    publish(SagaStatus::Executing, &records);
                }
                Err(err) => {
                    records[index].status = SagaStepStatus::Failed;
                    tracing::error!(step = %step.name, error = %err, "saga step failed, compensating");
                    let fully_compensated =
                        self.compensate(&self.steps[..index], &mut records).await;
                    let status = if index == 0 || !fully_compensated {
                        SagaStatus::Failed
                    } else {
                        SagaStatus::Compensated
                    };
                    publish(status, &records);
                    return Err(err);
                }
            }
        }

        publish(SagaStatus::Completed, &records);
        Ok(SagaSnapshot {
            status: SagaStatus::Completed,
            steps: records.into_iter().map(|r| (r.name, r.status)).collect(),
        })
    }

    async fn run_step_with_retry(&self, step: &SagaStep) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match (step.action)().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < step.max_retries && err.is_transient() => {
                    let backoff = Duration::from_secs(
                        2u64.saturating_pow(attempt).min(self.retry.max_backoff_secs),
                    );
                    tracing::warn!(
                        step = %step.name,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %err,
                        "saga step failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs every completed step's compensation in reverse order. A single
    /// compensation failing does not stop the rollback of earlier steps,
    /// but the saga as a whole is then left with partially-undone side
    /// effects, so the caller surfaces `Failed` rather than `Compensated`.
    /// Returns whether every attempted compensation succeeded.
    async fn compensate(&self, completed: &[SagaStep], records: &mut [StepRecord]) -> bool {
        let mut fully_compensated = true;
        for (index, step) in completed.iter().enumerate().rev() {
            if records[index].status != SagaStepStatus::Completed {
                continue;
            }
            let Some(compensation) = &step.compensation else {
                continue;
            };
            tracing::info!(step = %step.name, "compensating saga step");
            match compensation().await {
                Ok(()) => {
                    records[index].status = SagaStepStatus::Compensated;
                }
                Err(err) => {
                    fully_compensated = false;
                    tracing::error!(step = %step.name, error = %err, "compensation failed, continuing rollback");
                }
            }
        }
        fully_compensated
    }
}

/// Tracks in-flight and recently-finished saga snapshots by id, for a
/// `GET /sagas`-style observability endpoint. Terminal entries accumulate
/// until [`SagaRegistry::cleanup_completed`] is called, matching the
/// original system's periodic sweep rather than an automatic expiry.
#[derive(Default)]
pub struct SagaRegistry {
    sagas: Mutex<HashMap<String, SagaSnapshot>>,
}

impl SagaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for `saga_id`.
    pub fn register(&self, saga_id: &str, snapshot: SagaSnapshot) {
        self.sagas
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(saga_id.to_string(), snapshot);
    }

    /// Look up a saga's current snapshot.
    #[must_use]
    pub fn get(&self, saga_id: &str) -> Option<SagaSnapshot> {
        self.sagas
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(saga_id)
            .cloned()
    }

    /// Snapshot every tracked saga, for `GET /sagas`.
    #[must_use]
    pub fn all(&self) -> Vec<(String, SagaSnapshot)> {
        self.sagas
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(id, snapshot)| (id.clone(), snapshot.clone()))
            .collect()
    }

    /// Remove every saga whose status is terminal (`Completed`,
    /// `Compensated`, or `Failed`). Returns the number removed.
    pub fn cleanup_completed(&self) -> usize {
        let mut sagas = self.sagas.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = sagas.len();
        sagas.retain(|_, snapshot| snapshot.status == SagaStatus::Executing);
        before - sagas.len()
    }
}
