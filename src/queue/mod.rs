//! Durable task queue: routing keys, priority, retry/backoff with jitter,
//! a dead-letter queue, and late-ack (a task stays `Processing` until the
//! worker explicitly acks/naks it, so a crashed worker's tasks are visible
//! as stuck rather than silently lost).

use crate::config::{EnqueueOptions, TaskQueueConfig};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// A task's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting to be dequeued.
    Pending,
    /// Dequeued by a worker, awaiting ack/nak.
    Processing,
    /// Acked by a worker.
    Success,
    /// Nak'd and re-queued for another attempt.
    Retrying,
    /// Nak'd with retries exhausted.
    DeadLetter,
}

/// A unit of work: a routing key (e.g. `enrollment.group_detail`), an
/// opaque JSON payload, priority, and retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Server-assigned task id.
    pub id: String,
    /// Routing key a worker pool subscribes to.
    pub routing_key: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Priority; queues dequeue high before normal before low.
    pub priority: crate::config::TaskPriority,
    /// Attempts made so far (0 on first delivery).
    pub attempt: u32,
    /// Maximum attempts before dead-lettering.
    pub max_retries: u32,
    /// Deadline past which a worker should treat the task as overdue but
    /// continue (soft).
    pub soft_deadline_secs: u64,
    /// Deadline past which a worker must abort the task (hard).
    pub hard_deadline_secs: u64,
}

/// A point-in-time record, for `stats()` and result lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// The task itself, as most recently delivered.
    pub task: Task,
    /// Current status.
    pub status: TaskStatus,
    /// Result payload, once `Success`.
    pub result: Option<serde_json::Value>,
    /// Failure reason, once `Retrying` or `DeadLetter`.
    pub error: Option<String>,
}

/// Aggregate queue counts, for monitoring.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    /// Tasks waiting to be dequeued.
    pub pending: u64,
    /// Tasks currently checked out by a worker.
    pub processing: u64,
    /// Tasks that completed successfully.
    pub success: u64,
    /// Tasks dead-lettered.
    pub dead_letter: u64,
}

/// Exponential backoff with jitter: `min(base * multiplier^attempt, max)`,
/// then +/- up to 20% jitter when enabled.
#[must_use]
pub fn backoff_for_attempt(config: &TaskQueueConfig, attempt: u32) -> Duration {
    let exp = config.backoff_multiplier.saturating_pow(attempt);
    let raw = config.backoff_base_secs.saturating_mul(exp).min(config.backoff_max_secs);
    if !config.jitter || raw == 0 {
        return Duration::from_secs(raw);
    }
    let jitter_span = (raw / 5).max(1);
    let delta = rand::thread_rng().gen_range(0..=jitter_span);
    Duration::from_secs(raw.saturating_sub(jitter_span / 2).saturating_add(delta))
}

/// Durable task queue contract: enqueue, dequeue, ack/nak, cancel, stats.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a new task under `routing_key`.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn enqueue(
        &self,
        routing_key: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String>;

    /// Dequeue up to `prefetch` tasks matching `routing_key`, highest
    /// priority first, moving them to `Processing`.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn dequeue(&self, routing_key: &str, prefetch: usize) -> Result<Vec<Task>>;

    /// Acknowledge successful completion.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn ack(&self, task_id: &str, result: serde_json::Value) -> Result<()>;

    /// Negative-acknowledge: re-queue with backoff if attempts remain,
    /// otherwise dead-letter.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn nak(&self, task_id: &str, error: &str) -> Result<()>;

    /// Cancel a pending task. No-op if already dequeued.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn cancel(&self, task_id: &str) -> Result<bool>;

    /// Look up a task's current record.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Aggregate counts across all routing keys.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn stats(&self) -> Result<QueueStats>;

    /// Drain and return every dead-lettered task, clearing the DLQ.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn purge_dlq(&self) -> Result<Vec<TaskRecord>>;
}

struct Lanes {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn push(&mut self, priority: crate::config::TaskPriority, id: String) {
        use crate::config::TaskPriority::{High, Low, Normal};
        match priority {
            High => self.high.push_back(id),
            Normal => self.normal.push_back(id),
            Low => self.low.push_back(id),
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// A fully in-process [`TaskQueue`] for tests and single-process
/// deployments. Delayed re-queues (backoff) are modeled by stamping a
/// `ready_at` tick and filtering at dequeue time rather than a real timer
/// wheel.
pub struct InMemoryTaskQueue {
    config: TaskQueueConfig,
    lanes: Mutex<std::collections::HashMap<String, Lanes>>,
    records: DashMap<String, TaskRecord>,
    dead_letters: Mutex<Vec<String>>,
    ready_at: DashMap<String, std::time::Instant>,
    next_id: AtomicU64,
}

impl InMemoryTaskQueue {
    /// Build a queue from its configuration.
    #[must_use]
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            config,
            lanes: Mutex::new(std::collections::HashMap::new()),
            records: DashMap::new(),
            dead_letters: Mutex::new(Vec::new()),
            ready_at: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn generate_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("task-{seq}-{}", Uuid::new_v4())
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(TaskQueueConfig::default())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        routing_key: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        let id = self.generate_id();
        let task = Task {
            id: id.clone(),
            routing_key: routing_key.to_string(),
            payload,
            priority: options.priority,
            attempt: 0,
            max_retries: options.max_retries,
            soft_deadline_secs: options.soft_deadline_secs,
            hard_deadline_secs: options.hard_deadline_secs,
        };
        self.records.insert(
            id.clone(),
            TaskRecord {
                task,
                status: TaskStatus::Pending,
                result: None,
                error: None,
            },
        );
        self.lanes
            .lock()
            .unwrap()
            .entry(routing_key.to_string())
            .or_insert_with(Lanes::new)
            .push(options.priority, id.clone());
        tracing::info!(task_id = %id, routing_key, "task enqueued");
        Ok(id)
    }

    async fn dequeue(&self, routing_key: &str, prefetch: usize) -> Result<Vec<Task>> {
        let mut lanes = self.lanes.lock().unwrap();
        let Some(lane) = lanes.get_mut(routing_key) else {
            return Ok(Vec::new());
        };
        let now = std::time::Instant::now();
        let mut out = Vec::with_capacity(prefetch);
        let mut deferred = Vec::new();
        while out.len() < prefetch {
            let Some(id) = lane.pop() else { break };
            if let Some(ready_at) = self.ready_at.get(&id) {
                if *ready_at > now {
                    deferred.push((id, true));
                    continue;
                }
            }
            self.ready_at.remove(&id);
            if let Some(mut record) = self.records.get_mut(&id) {
                record.status = TaskStatus::Processing;
                out.push(record.task.clone());
            }
        }
        for (id, _) in deferred {
            let priority = self
                .records
                .get(&id)
                .map_or(crate::config::TaskPriority::Normal, |r| r.task.priority);
            lane.push(priority, id);
        }
        if out.is_empty() {
            tracing::debug!(routing_key, "dequeue found nothing ready");
        }
        Ok(out)
    }

    async fn ack(&self, task_id: &str, result: serde_json::Value) -> Result<()> {
        let mut record = self
            .records
            .get_mut(task_id)
            .ok_or_else(|| CoreError::NotFound {
                what: format!("task {task_id}"),
            })?;
        record.status = TaskStatus::Success;
        record.result = Some(result);
        tracing::info!(task_id, "task acked");
        Ok(())
    }

    async fn nak(&self, task_id: &str, error: &str) -> Result<()> {
        let routing_key;
        let should_retry;
        {
            let mut record = self
                .records
                .get_mut(task_id)
                .ok_or_else(|| CoreError::NotFound {
                    what: format!("task {task_id}"),
                })?;
            record.error = Some(error.to_string());
            record.task.attempt += 1;
            should_retry = record.task.attempt <= record.task.max_retries;
            record.status = if should_retry {
                TaskStatus::Retrying
            } else {
                TaskStatus::DeadLetter
            };
            routing_key = record.task.routing_key.clone();
        }

        if should_retry {
            let attempt = self.records.get(task_id).map(|r| r.task.attempt).unwrap_or(0);
            let backoff = backoff_for_attempt(&self.config, attempt);
            self.ready_at
                .insert(task_id.to_string(), std::time::Instant::now() + backoff);
            let priority = self
                .records
                .get(task_id)
                .map_or(crate::config::TaskPriority::Normal, |r| r.task.priority);
            self.lanes
                .lock()
                .unwrap()
                .entry(routing_key)
                .or_insert_with(Lanes::new)
                .push(priority, task_id.to_string());
            tracing::warn!(task_id, backoff_secs = backoff.as_secs(), error, "task nak'd, retrying");
        } else {
            self.dead_letters.lock().unwrap().push(task_id.to_string());
            tracing::error!(task_id, error, "task retries exhausted, dead-lettered");
        }
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut record = match self.records.get_mut(task_id) {
            Some(r) => r,
            None => return Ok(false),
        };
        if record.status != TaskStatus::Pending {
            return Ok(false);
        }
        record.status = TaskStatus::DeadLetter;
        record.error = Some("cancelled".to_string());
        drop(record);
        let mut lanes = self.lanes.lock().unwrap();
        for lane in lanes.values_mut() {
            lane.high.retain(|id| id != task_id);
            lane.normal.retain(|id| id != task_id);
            lane.low.retain(|id| id != task_id);
        }
        Ok(true)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.get(task_id).map(|r| r.clone()))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for entry in &self.records {
            match entry.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Retrying => stats.pending += 1,
                TaskStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        Ok(stats)
    }

    async fn purge_dlq(&self) -> Result<Vec<TaskRecord>> {
        let ids = std::mem::take(&mut *self.dead_letters.lock().unwrap());
        Ok(ids
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| r.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnqueueOptions;
    use proptest::prelude::*;

    fn opts() -> EnqueueOptions {
        EnqueueOptions {
            priority: crate::config::TaskPriority::Normal,
            max_retries: 2,
            soft_deadline_secs: 60,
            hard_deadline_secs: 120,
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_moves_to_processing() {
        let queue = InMemoryTaskQueue::default();
        let id = queue
            .enqueue("enrollment.detail", serde_json::json!({"n": 1}), opts())
            .await
            .unwrap();
        let tasks = queue.dequeue("enrollment.detail", 5).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn high_priority_dequeues_before_normal() {
        let queue = InMemoryTaskQueue::default();
        let mut low_opts = opts();
        low_opts.priority = crate::config::TaskPriority::Low;
        let mut high_opts = opts();
        high_opts.priority = crate::config::TaskPriority::High;

        queue.enqueue("k", serde_json::json!({}), low_opts).await.unwrap();
        let high_id = queue.enqueue("k", serde_json::json!({}), high_opts).await.unwrap();

        let tasks = queue.dequeue("k", 1).await.unwrap();
        assert_eq!(tasks[0].id, high_id);
    }

    #[tokio::test]
    async fn nak_with_retries_remaining_requeues() {
        let queue = InMemoryTaskQueue::new(TaskQueueConfig {
            jitter: false,
            backoff_base_secs: 0,
            ..TaskQueueConfig::default()
        });
        let id = queue
            .enqueue("k", serde_json::json!({}), opts())
            .await
            .unwrap();
        queue.dequeue("k", 1).await.unwrap();
        queue.nak(&id, "transient failure").await.unwrap();
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Retrying);

        let tasks = queue.dequeue("k", 1).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempt, 1);
    }

    #[tokio::test]
    async fn nak_past_max_retries_dead_letters() {
        let queue = InMemoryTaskQueue::new(TaskQueueConfig {
            jitter: false,
            backoff_base_secs: 0,
            ..TaskQueueConfig::default()
        });
        let mut single_retry = opts();
        single_retry.max_retries = 0;
        let id = queue
            .enqueue("k", serde_json::json!({}), single_retry)
            .await
            .unwrap();
        queue.dequeue("k", 1).await.unwrap();
        queue.nak(&id, "fatal").await.unwrap();

        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::DeadLetter);
        let drained = queue.purge_dlq().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.purge_dlq().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cancel_only_affects_pending_tasks() {
        let queue = InMemoryTaskQueue::default();
        let id = queue.enqueue("k", serde_json::json!({}), opts()).await.unwrap();
        assert!(queue.cancel(&id).await.unwrap());
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::DeadLetter);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = TaskQueueConfig {
            backoff_base_secs: 10,
            backoff_multiplier: 2,
            backoff_max_secs: 50,
            jitter: false,
            ..TaskQueueConfig::default()
        };
        assert_eq!(backoff_for_attempt(&config, 0), Duration::from_secs(10));
        assert_eq!(backoff_for_attempt(&config, 1), Duration::from_secs(20));
        assert_eq!(backoff_for_attempt(&config, 3), Duration::from_secs(50));
    }

    proptest! {
        /// Invariant 5: backoff never exceeds `backoff_max_secs`, for any
        /// base/multiplier/attempt combination, with or without jitter.
        #[test]
        fn backoff_never_exceeds_cap(
            base in 0u64..120,
            multiplier in 0u32..5,
            max in 0u64..600,
            attempt in 0u32..64,
            jitter in any::<bool>(),
        ) {
            let config = TaskQueueConfig {
                backoff_base_secs: base,
                backoff_multiplier: multiplier,
                backoff_max_secs: max,
                jitter,
                ..TaskQueueConfig::default()
            };
            let backoff = backoff_for_attempt(&config, attempt);
            prop_assert!(backoff.as_secs() <= max);
        }

        /// Without jitter, backoff is non-decreasing as attempts increase.
        #[test]
        fn backoff_is_monotonic_without_jitter(
            base in 1u64..60,
            multiplier in 1u32..4,
            max in 1u64..600,
            attempt in 0u32..30,
        ) {
            let config = TaskQueueConfig {
                backoff_base_secs: base,
                backoff_multiplier: multiplier,
                backoff_max_secs: max,
                jitter: false,
                ..TaskQueueConfig::default()
            };
            let current = backoff_for_attempt(&config, attempt);
            let next = backoff_for_attempt(&config, attempt + 1);
            prop_assert!(next >= current);
        }
    }
}
