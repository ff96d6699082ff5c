//! Worker pool: a fixed number of concurrent tasks draining a
//! [`TaskQueue`] for one or more routing keys, each task handled by a
//! `Handler`, with ack/nak and soft/hard deadline enforcement.

use crate::config::WorkerPoolConfig;
use crate::error::Result;
use crate::queue::{Task, TaskQueue};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handles one dequeued task, returning its result payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute `task`.
    ///
    /// # Errors
    /// Any error causes the pool to nak the task.
    async fn handle(&self, task: &Task) -> Result<serde_json::Value>;
}

/// Runs `concurrency` worker loops against a [`TaskQueue`] for a single
/// routing key, each recycled after `max_tasks_per_worker` handled tasks.
pub struct WorkerPool<Q: TaskQueue + 'static, H: TaskHandler + 'static> {
    queue: Arc<Q>,
    handler: Arc<H>,
    routing_key: String,
    config: WorkerPoolConfig,
    running: Arc<AtomicBool>,
}

impl<Q: TaskQueue + 'static, H: TaskHandler + 'static> WorkerPool<Q, H> {
    /// Build a pool over `queue`, dispatching tasks for `routing_key` to
    /// `handler`.
    pub fn new(queue: Arc<Q>, handler: Arc<H>, routing_key: impl Into<String>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            handler,
            routing_key: routing_key.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `concurrency` worker loops. Returns their join handles; the
    /// caller decides whether to await or detach them.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        (0..self.config.concurrency)
            .map(|worker_index| {
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let routing_key = self.routing_key.clone();
                let config = self.config;
                let running = self.running.clone();
                tokio::spawn(async move {
                    worker_loop(worker_index, queue, handler, routing_key, config, running).await;
                })
            })
            .collect()
    }

    /// Signal every worker loop to stop after its current batch.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn worker_loop<Q: TaskQueue, H: TaskHandler>(
    worker_index: usize,
    queue: Arc<Q>,
    handler: Arc<H>,
    routing_key: String,
    config: WorkerPoolConfig,
    running: Arc<AtomicBool>,
) {
    let handled = AtomicU64::new(0);
    tracing::info!(worker_index, routing_key, "worker started");

    while running.load(Ordering::SeqCst) {
        if handled.load(Ordering::SeqCst) >= config.max_tasks_per_worker {
            tracing::info!(worker_index, "worker recycling after reaching max tasks");
            break;
        }

        let tasks = match queue.dequeue(&routing_key, config.prefetch).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(worker_index, error = %err, "dequeue failed");
                tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
                continue;
            }
        };

        if tasks.is_empty() {
            tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
            continue;
        }

        for task in tasks {
            handled.fetch_add(1, Ordering::SeqCst);
            run_one(&queue, &handler, &task).await;
        }
    }

    tracing::info!(worker_index, "worker stopped");
}

async fn run_one<Q: TaskQueue, H: TaskHandler>(queue: &Arc<Q>, handler: &Arc<H>, task: &Task) {
    let hard_deadline = Duration::from_secs(task.hard_deadline_secs);
    let soft_deadline = Duration::from_secs(task.soft_deadline_secs);

    let handle_fut = handler.handle(task);
    tokio::pin!(handle_fut);
    let soft_sleep = tokio::time::sleep(soft_deadline);
    tokio::pin!(soft_sleep);
    let mut soft_deadline_hit = false;

    let outcome = tokio::time::timeout(hard_deadline, async {
        loop {
            tokio::select! {
                result = &mut handle_fut => return result,
                () = &mut soft_sleep, if !soft_deadline_hit => {
                    soft_deadline_hit = true;
                    tracing::warn!(
                        task_id = %task.id,
                        soft_deadline_secs = task.soft_deadline_secs,
                        "task exceeded soft deadline, still running toward hard deadline"
                    );
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(result)) => {
            if let Err(err) = queue.ack(&task.id, result).await {
                tracing::error!(task_id = %task.id, error = %err, "failed to ack task");
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(task_id = %task.id, error = %err, "task handler failed");
            if let Err(nak_err) = queue.nak(&task.id, &err.to_string()).await {
                tracing::error!(task_id = %task.id, error = %nak_err, "failed to nak task");
            }
        }
        Err(_timeout) => {
            tracing::error!(task_id = %task.id, "task exceeded hard deadline");
            if let Err(nak_err) = queue.nak(&task.id, "hard deadline exceeded").await {
                tracing::error!(task_id = %task.id, error = %nak_err, "failed to nak timed-out task");
            }
        }
    }
}
