//! End-to-end scenarios over in-memory fakes.

use enrollment_core::breaker::CircuitBreaker;
use enrollment_core::config::{CircuitBreakerConfig, EnqueueOptions, RetryConfig};
use enrollment_core::dispatcher::Dispatcher;
use enrollment_core::error::CoreError;
use enrollment_core::idempotency::KvIdempotencyStore;
use enrollment_core::kv::InMemoryKvStore;
use enrollment_core::queue::{InMemoryTaskQueue, TaskQueue};
use enrollment_core::reservation::GroupReservation;
use enrollment_core::store::{Group, InMemoryEnrollmentStore, Schedule};
use enrollment_core::workflow::{EnrollmentRequest, EnrollmentWorkflow, NoopNotifier};
use std::sync::Arc;
use std::time::Duration;

fn schedule(days: &[u8], start: u32, end: u32) -> Schedule {
    Schedule {
        days: days.iter().copied().collect(),
        start_minute: start,
        end_minute: end,
    }
}

fn retry() -> RetryConfig {
    RetryConfig {
        max_retries: 1,
        max_backoff_secs: 0,
    }
}

/// S1: happy path, single group.
#[tokio::test]
async fn s1_happy_path_single_group() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    store.seed_student("RA0001");
    store.seed_period("1-2025", true);
    store.seed_group(Group {
        code: "G-MAT101-A".to_string(),
        materia: "MAT101".to_string(),
        capacity: 30,
        current_enrolled: 10,
        schedule: schedule(&[0], 8 * 60, 10 * 60),
    });

    let breaker = Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()));
    let workflow = EnrollmentWorkflow::new(
        store.clone(),
        breaker,
        retry(),
        Duration::from_secs(30),
        Arc::new(NoopNotifier),
    );
    let kv = InMemoryKvStore::new();
    let reservation = GroupReservation::new(&kv);

    let outcome = workflow
        .enroll(
            EnrollmentRequest {
                student_id: "RA0001".to_string(),
                period_id: "1-2025".to_string(),
                group_codes: vec!["G-MAT101-A".to_string()],
            },
            &reservation,
        )
        .await
        .unwrap();

    assert_eq!(outcome.enrolled_groups, vec!["G-MAT101-A".to_string()]);
    assert_eq!(store.current_enrolled("G-MAT101-A"), Some(11));
    assert_eq!(store.detail_count_for_group("G-MAT101-A"), 1);
}

/// S2: capacity exhaustion under concurrency.
#[tokio::test]
async fn s2_capacity_exhaustion_under_concurrency() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    store.seed_period("1-2025", true);
    store.seed_group(Group {
        code: "G1".to_string(),
        materia: "MAT101".to_string(),
        capacity: 1,
        current_enrolled: 0,
        schedule: schedule(&[0], 8 * 60, 10 * 60),
    });
    for i in 0..10 {
        store.seed_student(format!("RA{i:04}"));
    }

    let breaker = Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()));
    let workflow = Arc::new(EnrollmentWorkflow::new(
        store.clone(),
        breaker,
        retry(),
        Duration::from_secs(30),
        Arc::new(NoopNotifier),
    ));
    let kv = Arc::new(InMemoryKvStore::new());

    let mut handles = Vec::new();
    for i in 0..10 {
        let workflow = workflow.clone();
        let kv = kv.clone();
        handles.push(tokio::spawn(async move {
            let reservation = GroupReservation::new(&*kv);
            workflow
                .enroll(
                    EnrollmentRequest {
                        student_id: format!("RA{i:04}"),
                        period_id: "1-2025".to_string(),
                        group_codes: vec!["G1".to_string()],
                    },
                    &reservation,
                )
                .await
        }));
    }

    let mut successes = 0;
    let mut capacity_failures = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(CoreError::CapacityExhausted { .. }) => capacity_failures += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(capacity_failures, 9);
    assert_eq!(store.current_enrolled("G1"), Some(1));
}

/// S3: idempotent retry via the dispatcher.
#[tokio::test]
async fn s3_idempotent_retry_via_dispatcher() {
    let queue = Arc::new(InMemoryTaskQueue::new(Default::default()));
    let idempotency = Arc::new(KvIdempotencyStore::new(InMemoryKvStore::new()));
    let dispatcher = Dispatcher::new(queue.clone(), idempotency, Duration::from_secs(7200));

    let first = dispatcher
        .dispatch_enrollment("RA0002", "1-2025", &["G1".to_string(), "G2".to_string()])
        .await
        .unwrap();
    let second = dispatcher
        .dispatch_enrollment("RA0002", "1-2025", &["G1".to_string(), "G2".to_string()])
        .await
        .unwrap();

    assert_eq!(first.correlation_id, second.correlation_id);
    assert!(second.deduplicated);

    let stats = queue.stats().await.unwrap();
    // One main task + 2 group tasks, enqueued exactly once total.
    assert_eq!(stats.pending, 3);
}

/// S4: schedule conflict rejects the second enrollment and leaves no detail row.
#[tokio::test]
async fn s4_schedule_conflict_rejects_without_writing_detail() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    store.seed_student("RA0003");
    store.seed_period("1-2025", true);
    store.seed_group(Group {
        code: "G-X".to_string(),
        materia: "MAT101".to_string(),
        capacity: 30,
        current_enrolled: 0,
        schedule: schedule(&[0, 2], 8 * 60, 10 * 60),
    });
    store.seed_group(Group {
        code: "G-Y".to_string(),
        materia: "FIS101".to_string(),
        capacity: 30,
        current_enrolled: 0,
        schedule: schedule(&[0], 9 * 60, 11 * 60),
    });

    let breaker = Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()));
    let workflow = EnrollmentWorkflow::new(
        store.clone(),
        breaker,
        retry(),
        Duration::from_secs(30),
        Arc::new(NoopNotifier),
    );
    let kv = InMemoryKvStore::new();
    let reservation = GroupReservation::new(&kv);

    workflow
        .enroll(
            EnrollmentRequest {
                student_id: "RA0003".to_string(),
                period_id: "1-2025".to_string(),
                group_codes: vec!["G-X".to_string()],
            },
            &reservation,
        )
        .await
        .unwrap();

    let result = workflow
        .enroll(
            EnrollmentRequest {
                student_id: "RA0003".to_string(),
                period_id: "1-2025".to_string(),
                group_codes: vec!["G-Y".to_string()],
            },
            &reservation,
        )
        .await;

    assert!(matches!(result, Err(CoreError::ScheduleConflict { .. })));
    assert_eq!(store.detail_count_for_group("G-Y"), 0);
}

/// S5: saga compensation when a later group lacks capacity.
#[tokio::test]
async fn s5_saga_compensation_on_capacity_exhaustion() {
    let store = Arc::new(InMemoryEnrollmentStore::new());
    store.seed_student("RA0004");
    store.seed_period("1-2025", true);
    store.seed_group(Group {
        code: "G1".to_string(),
        materia: "MAT101".to_string(),
        capacity: 30,
        current_enrolled: 5,
        schedule: schedule(&[0], 8 * 60, 10 * 60),
    });
    store.seed_group(Group {
        code: "G2".to_string(),
        materia: "FIS101".to_string(),
        capacity: 30,
        current_enrolled: 5,
        schedule: schedule(&[1], 8 * 60, 10 * 60),
    });
    store.seed_group(Group {
        code: "G3".to_string(),
        materia: "QUI101".to_string(),
        capacity: 5,
        current_enrolled: 5,
        schedule: schedule(&[2], 8 * 60, 10 * 60),
    });

    let breaker = Arc::new(CircuitBreaker::new("database", CircuitBreakerConfig::default()));
    let workflow = EnrollmentWorkflow::new(
        store.clone(),
        breaker,
        retry(),
        Duration::from_secs(30),
        Arc::new(NoopNotifier),
    );
    let kv = InMemoryKvStore::new();
    let reservation = GroupReservation::new(&kv);

    let result = workflow
        .enroll(
            EnrollmentRequest {
                student_id: "RA0004".to_string(),
                period_id: "1-2025".to_string(),
                group_codes: vec!["G1".to_string(), "G2".to_string(), "G3".to_string()],
            },
            &reservation,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(store.current_enrolled("G1"), Some(5));
    assert_eq!(store.current_enrolled("G2"), Some(5));
    assert_eq!(store.current_enrolled("G3"), Some(5));
    assert_eq!(store.detail_count_for_group("G1"), 0);
    assert_eq!(store.detail_count_for_group("G2"), 0);
    assert_eq!(store.detail_count_for_group("G3"), 0);
}

/// S6: breaker trip on repeated database failures.
struct FlakyStore {
    inner: InMemoryEnrollmentStore,
    fail_calls: std::sync::atomic::AtomicU32,
    fail_budget: u32,
}

#[async_trait::async_trait]
impl enrollment_core::store::EnrollmentStore for FlakyStore {
    async fn validate_student_active(&self, student_id: &str) -> enrollment_core::error::Result<()> {
        let n = self.fail_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n < self.fail_budget {
            return Err(CoreError::Transient {
                reason: "db connection reset".to_string(),
            });
        }
        self.inner.validate_student_active(student_id).await
    }

    async fn validate_period_active(&self, period_id: &str) -> enrollment_core::error::Result<()> {
        self.inner.validate_period_active(period_id).await
    }

    async fn lookup_existing_enrollment(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> enrollment_core::error::Result<Option<enrollment_core::store::Enrollment>> {
        self.inner.lookup_existing_enrollment(student_id, period_id).await
    }

    async fn insert_enrollment_header(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> enrollment_core::error::Result<String> {
        self.inner.insert_enrollment_header(student_id, period_id).await
    }

    async fn delete_enrollment_header(&self, enrollment_id: &str) -> enrollment_core::error::Result<()> {
        self.inner.delete_enrollment_header(enrollment_id).await
    }

    async fn has_detail_for_group(
        &self,
        enrollment_id: &str,
        group_code: &str,
    ) -> enrollment_core::error::Result<bool> {
        self.inner.has_detail_for_group(enrollment_id, group_code).await
    }

    async fn insert_enrollment_detail(
        &self,
        enrollment_id: &str,
        group_code: &str,
    ) -> enrollment_core::error::Result<String> {
        self.inner.insert_enrollment_detail(enrollment_id, group_code).await
    }

    async fn delete_enrollment_detail(&self, detail_id: &str) -> enrollment_core::error::Result<()> {
        self.inner.delete_enrollment_detail(detail_id).await
    }

    async fn increment_group_counter(&self, group_code: &str) -> enrollment_core::error::Result<()> {
        self.inner.increment_group_counter(group_code).await
    }

    async fn decrement_group_counter(&self, group_code: &str) -> enrollment_core::error::Result<()> {
        self.inner.decrement_group_counter(group_code).await
    }

    async fn get_group_materia(&self, group_code: &str) -> enrollment_core::error::Result<String> {
        self.inner.get_group_materia(group_code).await
    }

    async fn student_enrolled_materias(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> enrollment_core::error::Result<std::collections::HashSet<String>> {
        self.inner.student_enrolled_materias(student_id, period_id).await
    }

    async fn schedule_conflict(
        &self,
        group_code: &str,
        other_group_codes: &[String],
    ) -> enrollment_core::error::Result<Option<String>> {
        self.inner.schedule_conflict(group_code, other_group_codes).await
    }
}

#[tokio::test]
async fn s6_breaker_trips_after_consecutive_db_failures() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryEnrollmentStore::new(),
        fail_calls: std::sync::atomic::AtomicU32::new(0),
        fail_budget: 100,
    });
    store.inner.seed_student("RA0005");
    store.inner.seed_period("1-2025", true);

    let breaker = Arc::new(CircuitBreaker::new(
        "database",
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
            success_threshold: 1,
            call_timeout_ms: 1000,
        },
    ));

    for _ in 0..3 {
        let store = store.clone();
        let result = breaker
            .call(move || Box::pin(async move { store.validate_student_active("RA0005").await }))
            .await;
        assert!(matches!(result, Err(CoreError::Transient { .. })));
    }

    let store_fourth = store.clone();
    let fourth = breaker
        .call(move || Box::pin(async move { store_fourth.validate_student_active("RA0005").await }))
        .await;
    assert!(matches!(fourth, Err(CoreError::BreakerOpen { .. })));
    assert_eq!(store.fail_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}
