//! Configuration structures for the enrollment core.
//!
//! Every struct here is `serde`-deserializable with field-level defaults, so
//! a deployment can override only the knobs it cares about.

use serde::{Deserialize, Serialize};

/// Top-level configuration aggregating every component's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Circuit breaker configuration per named dependency.
    #[serde(default)]
    pub breakers: std::collections::HashMap<String, CircuitBreakerConfig>,
    /// Default retry policy for saga steps that don't override it.
    #[serde(default)]
    pub saga_retry: RetryConfig,
    /// Task queue configuration.
    #[serde(default)]
    pub task_queue: TaskQueueConfig,
    /// Worker pool configuration.
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    /// Idempotency cache TTL in seconds (default: 2 hours).
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// Group reservation TTL in seconds (default: 5 minutes).
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            breakers: std::collections::HashMap::new(),
            saga_retry: RetryConfig::default(),
            task_queue: TaskQueueConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
        }
    }
}

const fn default_idempotency_ttl_secs() -> u64 {
    7200
}

const fn default_reservation_ttl_secs() -> u64 {
    300
}

/// Circuit breaker configuration.
///
/// State machine and transition table are documented on
/// [`crate::breaker::CircuitBreaker`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that trip the breaker open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before admitting a half-open probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Consecutive successes (while half-open) required to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-call timeout in milliseconds; a timeout counts as a failure.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_recovery_timeout_secs() -> u64 {
    60
}

const fn default_success_threshold() -> u32 {
    3
}

const fn default_call_timeout_ms() -> u64 {
    15_000
}

/// Retry policy for a single saga step or task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in seconds for the exponential backoff (`2^attempt`,
    /// capped at `max_backoff_secs`).
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_max_backoff_secs() -> u64 {
    300
}

/// Task priority, attached at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background / best-effort work.
    Low,
    /// Default priority for enrollment tasks.
    #[default]
    Normal,
    /// Time-sensitive work (e.g. health checks).
    High,
}

/// Options accepted by `TaskQueue::enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Maximum retry attempts before moving to the DLQ.
    #[serde(default = "default_max_retries_task")]
    pub max_retries: u32,
    /// Soft deadline in seconds; handlers should check for cancellation
    /// past this point.
    #[serde(default = "default_soft_deadline_secs")]
    pub soft_deadline_secs: u64,
    /// Hard deadline in seconds; the worker terminates the task.
    #[serde(default = "default_hard_deadline_secs")]
    pub hard_deadline_secs: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::default(),
            max_retries: default_max_retries_task(),
            soft_deadline_secs: default_soft_deadline_secs(),
            hard_deadline_secs: default_hard_deadline_secs(),
        }
    }
}

const fn default_max_retries_task() -> u32 {
    5
}

const fn default_soft_deadline_secs() -> u64 {
    300
}

const fn default_hard_deadline_secs() -> u64 {
    600
}

/// Task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// How long terminal task records are retained (default: 1 hour).
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Retry backoff base in seconds (default: 10).
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Retry backoff multiplier (default: 2).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u64,
    /// Retry backoff cap in seconds (default: 300).
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Whether to add jitter to the computed backoff.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_result_ttl_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_secs: default_backoff_max_secs(),
            jitter: true,
        }
    }
}

const fn default_result_ttl_secs() -> u64 {
    3600
}

const fn default_backoff_base_secs() -> u64 {
    10
}

const fn default_backoff_multiplier() -> u64 {
    2
}

const fn default_backoff_max_secs() -> u64 {
    300
}

const fn default_true() -> bool {
    true
}

/// Worker pool configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks (default: 4).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum unacked messages per worker (default: 1, to prevent
    /// queue-head starvation).
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Recycle a worker after this many processed tasks (default: 1000).
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u64,
    /// How often an idle worker polls for new tasks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            prefetch: default_prefetch(),
            max_tasks_per_worker: default_max_tasks_per_worker(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

const fn default_concurrency() -> usize {
    4
}

const fn default_prefetch() -> usize {
    1
}

const fn default_max_tasks_per_worker() -> u64 {
    1000
}

const fn default_poll_interval_ms() -> u64 {
    100
}
