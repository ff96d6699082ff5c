//! Dispatcher: the public entry point a caller (an HTTP handler, typically)
//! uses to submit enrollment requests. Generates the idempotency
//! fingerprint, enqueues one task per group plus a correlating main task,
//! and exposes a status-multiplex lookup that tolerates individual lookup
//! failures rather than failing the whole batch.

use crate::config::EnqueueOptions;
use crate::error::Result;
use crate::idempotency::{fingerprint, IdempotencyStore};
use crate::queue::{TaskQueue, TaskStatus};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What enqueuing a (possibly multi-group) enrollment request returns.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    /// Id correlating every task in this request.
    pub correlation_id: String,
    /// The main enrollment task id.
    pub main_task_id: String,
    /// One task id per requested group.
    pub group_tasks: Vec<String>,
    /// Whether this result came from the idempotency cache rather than a
    /// fresh dispatch.
    pub deduplicated: bool,
}

/// Status for one task, keyed by task id; `None` when the lookup itself
/// failed (as opposed to the task genuinely not existing).
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusEntry {
    /// The task id queried.
    pub task_id: String,
    /// Its status, if the lookup succeeded and the task exists.
    pub status: Option<TaskStatus>,
}

/// One request within a bulk submission.
#[derive(Debug, Clone)]
pub struct BulkEnrollmentRequest {
    /// Student id.
    pub student_id: String,
    /// Period id.
    pub period_id: String,
    /// Group codes requested.
    pub group_codes: Vec<String>,
}

/// What dispatching a bulk submission returns: one task id per input
/// request, in the same order, enqueued on `enrollments_bulk`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkDispatchResult {
    /// Task ids, one per request, in input order.
    pub task_ids: Vec<String>,
}

/// Facade composing idempotency + the task queue behind one call.
pub struct Dispatcher<Q: TaskQueue, I: IdempotencyStore> {
    queue: Arc<Q>,
    idempotency: Arc<I>,
    idempotency_ttl: Duration,
}

impl<Q: TaskQueue, I: IdempotencyStore> Dispatcher<Q, I> {
    /// Build a dispatcher over a task queue and idempotency store.
    pub fn new(queue: Arc<Q>, idempotency: Arc<I>, idempotency_ttl: Duration) -> Self {
        Self {
            queue,
            idempotency,
            idempotency_ttl,
        }
    }

    /// Enqueue an enrollment request for `student_id`, deduplicating by the
    /// fingerprint of `(student_id, group_codes)`.
    ///
    /// # Errors
    /// Returns an error on queue or idempotency-store failure.
    pub async fn dispatch_enrollment(
        &self,
        student_id: &str,
        period_id: &str,
        group_codes: &[String],
    ) -> Result<DispatchResult> {
        let key = fingerprint(
            "enroll",
            student_id,
            &json!({"period_id": period_id, "groups": group_codes}),
        );
        let queue = self.queue.clone();
        let student_id_owned = student_id.to_string();
        let period_id_owned = period_id.to_string();
        let group_codes_owned = group_codes.to_vec();

        let (result, cached) = self
            .idempotency
            .get_or_run(
                &key,
                self.idempotency_ttl,
                Box::new(move || {
                    Box::pin(async move {
                        let correlation_id = Uuid::new_v4().to_string();
                        let main_task_id = queue
                            .enqueue(
                                "enrollment.main",
                                json!({
                                    "correlation_id": correlation_id,
                                    "student_id": student_id_owned,
                                    "period_id": period_id_owned,
                                    "group_codes": group_codes_owned,
                                }),
                                EnqueueOptions::default(),
                            )
                            .await?;

                        let mut group_tasks = Vec::with_capacity(group_codes_owned.len());
                        for code in &group_codes_owned {
                            let task_id = queue
                                .enqueue(
                                    "enrollment.group_detail",
                                    json!({
                                        "correlation_id": correlation_id,
                                        "student_id": student_id_owned,
                                        "group_code": code,
                                    }),
                                    EnqueueOptions::default(),
                                )
                                .await?;
                            group_tasks.push(task_id);
                        }

                        Ok(json!({
                            "correlation_id": correlation_id,
                            "main_task_id": main_task_id,
                            "group_tasks": group_tasks,
                        }))
                    })
                }),
            )
            .await?;

        let correlation_id = result["correlation_id"].as_str().unwrap_or_default().to_string();
        let main_task_id = result["main_task_id"].as_str().unwrap_or_default().to_string();
        let group_tasks = result["group_tasks"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(DispatchResult {
            correlation_id,
            main_task_id,
            group_tasks,
            deduplicated: cached,
        })
    }

    /// Dispatch a batch of enrollment requests in bulk mode: one task per
    /// request, enqueued on `enrollments_bulk`, unlike per-group dispatch
    /// mode which fans a single request out into one task per group.
    ///
    /// # Errors
    /// Returns an error on queue failure.
    pub async fn dispatch_bulk(&self, requests: &[BulkEnrollmentRequest]) -> Result<BulkDispatchResult> {
        let mut task_ids = Vec::with_capacity(requests.len());
        for request in requests {
            let task_id = self
                .queue
                .enqueue(
                    "enrollments_bulk",
                    json!({
                        "student_id": request.student_id,
                        "period_id": request.period_id,
                        "group_codes": request.group_codes,
                    }),
                    EnqueueOptions::default(),
                )
                .await?;
            task_ids.push(task_id);
        }
        Ok(BulkDispatchResult { task_ids })
    }

    /// Look up the status of every task id in `task_ids`. A failed
    /// individual lookup becomes a `None` entry rather than aborting the
    /// whole batch.
    pub async fn multi_status(&self, task_ids: &[String]) -> Vec<TaskStatusEntry> {
        let mut entries = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let status = match self.queue.get(task_id).await {
                Ok(Some(record)) => Some(record.status),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "status lookup failed, reporting unknown");
                    None
                }
            };
            entries.push(TaskStatusEntry {
                task_id: task_id.clone(),
                status,
            });
        }
        entries
    }
}
