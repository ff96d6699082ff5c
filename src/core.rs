//! Composition root: wires every component into one `Core` value owned by
//! the process, per the "model global registries as a single owned value"
//! design note.

use crate::breaker::Registry as BreakerRegistry;
use crate::config::CoreConfig;
use crate::dispatcher::Dispatcher;
use crate::idempotency::KvIdempotencyStore;
use crate::kv::{InMemoryKvStore, KVStore};
use crate::queue::InMemoryTaskQueue;
use crate::reservation::GroupReservation;
use crate::store::EnrollmentStore;
use crate::workflow::{EnrollmentNotifier, EnrollmentWorkflow, NoopNotifier};
use std::sync::Arc;
use std::time::Duration;

/// Every long-lived component the process needs, generic over the backing
/// key-value store and the enrollment store implementation so tests can
/// substitute in-memory fakes.
pub struct Core<KV: KVStore, S: EnrollmentStore> {
    /// Aggregated configuration.
    pub config: CoreConfig,
    /// Shared circuit breaker registry.
    pub breakers: Arc<BreakerRegistry>,
    /// Key-value backend for idempotency and reservation.
    pub kv: Arc<KV>,
    /// Idempotency cache.
    pub idempotency: Arc<KvIdempotencyStore<KV>>,
    /// Durable task queue.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Dispatcher facade.
    pub dispatcher: Arc<Dispatcher<InMemoryTaskQueue, KvIdempotencyStore<KV>>>,
    /// Enrollment saga workflow.
    pub workflow: Arc<EnrollmentWorkflow<S>>,
}

impl<KV: KVStore + Clone + 'static, S: EnrollmentStore + 'static> Core<KV, S> {
    /// Build a `Core` from a config, a shared `KVStore`, and an
    /// `EnrollmentStore`. The key-value store is reused for both the
    /// idempotency cache and group reservation locks.
    pub fn new(config: CoreConfig, kv: KV, store: S) -> Self {
        Self::with_notifier(config, kv, store, Arc::new(NoopNotifier))
    }

    /// Like [`Core::new`] but with a caller-supplied notifier.
    pub fn with_notifier(
        config: CoreConfig,
        kv: KV,
        store: S,
        notifier: Arc<dyn EnrollmentNotifier>,
    ) -> Self {
        let kv = Arc::new(kv);
        let breakers = Arc::new(BreakerRegistry::new());
        let database_breaker = breakers.get_or_create(
            "database",
            *config.breakers.get("database").unwrap_or(&crate::config::CircuitBreakerConfig::default()),
        );

        let idempotency = Arc::new(KvIdempotencyStore::new((*kv).clone()));
        let queue = Arc::new(InMemoryTaskQueue::new(config.task_queue.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            idempotency.clone(),
            Duration::from_secs(config.idempotency_ttl_secs),
        ));
        let workflow = Arc::new(EnrollmentWorkflow::new(
            Arc::new(store),
            database_breaker,
            config.saga_retry,
            Duration::from_secs(config.reservation_ttl_secs),
            notifier,
        ));

        Self {
            config,
            breakers,
            kv,
            idempotency,
            queue,
            dispatcher,
            workflow,
        }
    }

    /// Build a [`GroupReservation`] bound to this `Core`'s key-value store.
    #[must_use]
    pub fn reservation(&self) -> GroupReservation<'_, KV> {
        GroupReservation::new(&self.kv)
    }
}

/// Convenience constructor wiring every fake together, for tests and
/// single-process demos.
#[must_use]
pub fn in_memory_core(
    config: CoreConfig,
    store: crate::store::InMemoryEnrollmentStore,
) -> Core<InMemoryKvStore, crate::store::InMemoryEnrollmentStore> {
    Core::new(config, InMemoryKvStore::new(), store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Group, InMemoryEnrollmentStore, Schedule};

    #[tokio::test]
    async fn core_wires_dispatcher_and_workflow_together() {
        let store = InMemoryEnrollmentStore::new();
        store.seed_student("RA0001");
        store.seed_period("2026-1", true);
        store.seed_group(Group {
            code: "G1".to_string(),
            materia: "MAT101".to_string(),
            capacity: 5,
            current_enrolled: 0,
            schedule: Schedule {
                days: [0].into_iter().collect(),
                start_minute: 480,
                end_minute: 600,
            },
        });

        let core = in_memory_core(CoreConfig::default(), store);
        let dispatch = core
            .dispatcher
            .dispatch_enrollment("RA0001", "2026-1", &["G1".to_string()])
            .await
            .unwrap();
        assert!(!dispatch.main_task_id.is_empty());

        let reservation = core.reservation();
        let outcome = core
            .workflow
            .enroll(
                crate::workflow::EnrollmentRequest {
                    student_id: "RA0001".to_string(),
                    period_id: "2026-1".to_string(),
                    group_codes: vec!["G1".to_string()],
                },
                &reservation,
            )
            .await
            .unwrap();
        assert_eq!(outcome.enrolled_groups, vec!["G1".to_string()]);
    }
}
