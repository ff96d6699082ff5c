//! Fault-tolerant asynchronous job-processing core for academic enrollment.
//!
//! This crate is the saga/queue/resilience substrate an enrollment
//! microservice builds on; it owns no database schema and speaks no HTTP —
//! callers provide an [`store::EnrollmentStore`] implementation and drive
//! the [`dispatcher::Dispatcher`] / [`workflow::EnrollmentWorkflow`] from
//! their own transport layer.
//!
//! ```text
//! dispatcher::Dispatcher
//!   -> idempotency::IdempotencyStore (dedup by fingerprint)
//!   -> queue::TaskQueue (routing, priority, retry/backoff, DLQ)
//!        -> worker::WorkerPool
//!             -> workflow::EnrollmentWorkflow
//!                  -> reservation::GroupReservation (advisory lock)
//!                  -> saga::Saga (ordered steps + compensation)
//!                       -> breaker::CircuitBreaker (per-dependency)
//!                       -> store::EnrollmentStore (caller-provided)
//! ```
//!
//! Key properties:
//! - capacity safety is enforced by `EnrollmentStore::increment_group_counter`,
//!   not by the reservation lock, which is a contention-avoidance
//!   optimization only;
//! - saga compensation runs in reverse order and continues past individual
//!   compensation failures;
//! - every external dependency call the saga makes passes through a named
//!   circuit breaker.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod breaker;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod kv;
pub mod queue;
pub mod reservation;
pub mod saga;
pub mod store;
pub mod worker;
pub mod workflow;

pub use config::CoreConfig;
pub use core::{in_memory_core, Core};
pub use error::{CoreError, ErrorCategory, Result};
