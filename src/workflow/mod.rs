//! Enrollment workflow: composes the generic [`crate::saga`] engine into the
//! concrete six-step multi-group enrollment saga (§4.7).
//!
//! Steps: validate student/period, reserve groups, resolve or open the
//! enrollment header, insert one detail row per group (checking
//! materia-uniqueness and schedule conflicts first), commit group counters,
//! and best-effort notify. Only the group-detail and counter steps carry
//! compensations; validation has nothing to undo and notification failure
//! never rolls back a completed enrollment.

use crate::breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::{CoreError, Result};
use crate::reservation::GroupReservation;
use crate::saga::{Saga, SagaRegistry, SagaStep};
use crate::store::EnrollmentStore;
use std::sync::Arc;
use std::time::Duration;

/// A notifier invoked best-effort after a successful enrollment; failures
/// are logged and never fail or compensate the saga.
#[async_trait::async_trait]
pub trait EnrollmentNotifier: Send + Sync {
    /// Notify that `enrollment_id` was confirmed for `student_id`.
    async fn notify_confirmed(&self, enrollment_id: &str, student_id: &str) -> Result<()>;
}

/// A notifier that does nothing; the default when no real channel is wired.
pub struct NoopNotifier;

#[async_trait::async_trait]
impl EnrollmentNotifier for NoopNotifier {
    async fn notify_confirmed(&self, _enrollment_id: &str, _student_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Inputs for one multi-group enrollment request.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    /// Student id.
    pub student_id: String,
    /// Period id.
    pub period_id: String,
    /// Group codes requested, checked pairwise (and against the student's
    /// already-enrolled groups for the period) for schedule conflicts and
    /// for duplicate subjects.
    pub group_codes: Vec<String>,
}

/// Outcome of a successful enrollment.
#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    /// The enrollment header id (new or pre-existing).
    pub enrollment_id: String,
    /// Group codes successfully enrolled in this call.
    pub enrolled_groups: Vec<String>,
}

/// Runs the enrollment saga against an [`EnrollmentStore`], a reservation
/// layer, and the `database` circuit breaker.
pub struct EnrollmentWorkflow<S: EnrollmentStore> {
    store: Arc<S>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    reservation_ttl: Duration,
    notifier: Arc<dyn EnrollmentNotifier>,
    sagas: SagaRegistry,
}

impl<S: EnrollmentStore + 'static> EnrollmentWorkflow<S> {
    /// Build a workflow over `store`, guarded by `breaker`.
    pub fn new(
        store: Arc<S>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        reservation_ttl: Duration,
        notifier: Arc<dyn EnrollmentNotifier>,
    ) -> Self {
        Self {
            store,
            breaker,
            retry,
            reservation_ttl,
            notifier,
            sagas: SagaRegistry::new(),
        }
    }

    /// The registry of in-flight and recently-finished saga snapshots this
    /// workflow has run, for a `GET /sagas`-style caller.
    #[must_use]
    pub fn sagas(&self) -> &SagaRegistry {
        &self.sagas
    }

    /// Validate the request's schedule-conflict and materia-uniqueness
    /// invariants up front, then run the saga.
    ///
    /// # Errors
    /// [`CoreError::ScheduleConflict`] or [`CoreError::DuplicateMateria`]
    /// before any mutation happens; otherwise whatever the saga's failing
    /// step returns, after compensation has been attempted.
    pub async fn enroll(
        &self,
        request: EnrollmentRequest,
        reservation: &GroupReservation<'_, impl crate::kv::KVStore>,
    ) -> Result<EnrollmentOutcome> {
        self.check_internal_conflicts(
            &request.student_id,
            &request.period_id,
            &request.group_codes,
        )
        .await?;

        self.store.validate_student_active(&request.student_id).await?;
        self.store.validate_period_active(&request.period_id).await?;

        let mut already_enrolled = self
            .store
            .student_enrolled_materias(&request.student_id, &request.period_id)
            .await?;
        for code in &request.group_codes {
            let materia = self.store.get_group_materia(code).await?;
            if already_enrolled.contains(&materia) {
                return Err(CoreError::DuplicateMateria {
                    materia,
                    student_id: request.student_id.clone(),
                });
            }
            already_enrolled.insert(materia);
        }

        // Reservation is a contention-avoidance optimization, not the
        // correctness boundary (that's `increment_group_counter`'s row
        // lock). A conflict here just means we skip the fast-reject and
        // let the saga's capacity check decide, so it never turns a
        // would-be-successful request into a spurious rejection.
        let handle = match reservation
            .reserve(&request.student_id, &request.group_codes, self.reservation_ttl)
            .await
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::debug!(error = %err, "group reservation contended, proceeding without it");
                None
            }
        };

        let steps = self.build_steps(&request);
        let saga = Saga::new(steps, self.retry.clone());
        let saga_id = format!("{}:{}", request.student_id, request.period_id);
        let run_result = saga.run_tracked(&self.sagas, &saga_id).await;

        if let Some(handle) = &handle {
            if let Err(err) = reservation.release(handle).await {
                tracing::warn!(error = %err, "failed to release group reservation after saga completion");
            }
        }

        match run_result {
            Ok(_snapshot) => {
                let enrollment = self
                    .store
                    .lookup_existing_enrollment(&request.student_id, &request.period_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::Invariant(
                            "enrollment header missing after successful saga".to_string(),
                        )
                    })?;
                Ok(EnrollmentOutcome {
                    enrollment_id: enrollment.id,
                    enrolled_groups: request.group_codes.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Check every requested group's schedule against both the other
    /// groups in this same request and the groups the student already
    /// holds a detail row for in this period (§4.7 step 4).
    async fn check_internal_conflicts(
        &self,
        student_id: &str,
        period_id: &str,
        group_codes: &[String],
    ) -> Result<()> {
        let existing = self
            .store
            .student_enrolled_group_codes(student_id, period_id)
            .await?;
        for (i, code) in group_codes.iter().enumerate() {
            let mut others = group_codes[i + 1..].to_vec();
            others.extend(existing.iter().cloned());
            if let Some(conflict) = self.store.schedule_conflict(code, &others).await? {
                return Err(CoreError::ScheduleConflict {
                    group_a: code.clone(),
                    group_b: conflict,
                });
            }
        }
        Ok(())
    }

    fn build_steps(&self, request: &EnrollmentRequest) -> Vec<SagaStep> {
        let store = self.store.clone();
        let breaker = self.breaker.clone();
        let student_id = request.student_id.clone();
        let period_id = request.period_id.clone();
        let group_codes = request.group_codes.clone();
        let notifier = self.notifier.clone();

        let mut steps = Vec::new();

        {
            let store = store.clone();
            let breaker = breaker.clone();
            let student_id = student_id.clone();
            let period_id = period_id.clone();
            let created_header = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let created_header_comp = created_header.clone();
            steps.push(
                SagaStep::new("resolve_enrollment_header", 2, move || {
                    let store = store.clone();
                    let breaker = breaker.clone();
                    let student_id = student_id.clone();
                    let period_id = period_id.clone();
                    let created_header = created_header.clone();
                    Box::pin(async move {
                        let store2 = store.clone();
                        let student = student_id.clone();
                        let period = period_id.clone();
                        breaker
                            .call(move || {
                                let store = store2.clone();
                                let student = student.clone();
                                let period = period.clone();
                                let created_header = created_header.clone();
                                Box::pin(async move {
                                    match store.lookup_existing_enrollment(&student, &period).await? {
                                        Some(_) => Ok(()),
                                        None => {
                                            store.insert_enrollment_header(&student, &period).await?;
                                            created_header.store(true, std::sync::atomic::Ordering::SeqCst);
                                            Ok(())
                                        }
                                    }
                                })
                            })
                            .await
                    })
                })
                .with_compensation(move || {
                    let store = store.clone();
                    let student_id = student_id.clone();
                    let period_id = period_id.clone();
                    let created_header = created_header_comp.clone();
                    Box::pin(async move {
                        if !created_header.load(std::sync::atomic::Ordering::SeqCst) {
                            return Ok(());
                        }
                        if let Some(existing) = store
                            .lookup_existing_enrollment(&student_id, &period_id)
                            .await?
                        {
                            store.delete_enrollment_header(&existing.id).await?;
                        }
                        Ok(())
                    })
                }),
            );
        }

        for code in &group_codes {
            let store_action = store.clone();
            let breaker_action = breaker.clone();
            let student_action = student_id.clone();
            let period_action = period_id.clone();
            let code_action = code.clone();

            let store_comp = store.clone();
            let code_comp = code.clone();
            let inserted_detail: Arc<std::sync::Mutex<Option<String>>> =
                Arc::new(std::sync::Mutex::new(None));
            let inserted_detail_action = inserted_detail.clone();
            let inserted_detail_comp = inserted_detail.clone();

            steps.push(
                SagaStep::new(format!("enroll_detail_{code}"), 2, move || {
                    let store = store_action.clone();
                    let breaker = breaker_action.clone();
                    let student_id = student_action.clone();
                    let period_id = period_action.clone();
                    let code = code_action.clone();
                    let inserted_detail = inserted_detail_action.clone();
                    Box::pin(async move {
                        breaker
                            .call(move || {
                                let store = store.clone();
                                let student_id = student_id.clone();
                                let period_id = period_id.clone();
                                let code = code.clone();
                                let inserted_detail = inserted_detail.clone();
                                Box::pin(async move {
                                    let enrollment = store
                                        .lookup_existing_enrollment(&student_id, &period_id)
                                        .await?
                                        .ok_or_else(|| CoreError::Invariant(
                                            "enrollment header missing at detail insert".to_string(),
                                        ))?;
                                    if store.has_detail_for_group(&enrollment.id, &code).await? {
                                        return Ok(());
                                    }
                                    let detail_id =
                                        store.insert_enrollment_detail(&enrollment.id, &code).await?;
                                    *inserted_detail.lock().unwrap() = Some(detail_id);
                                    Ok(())
                                })
                            })
                            .await
                    })
                })
                .with_compensation(move || {
                    let store = store_comp.clone();
                    let code = code_comp.clone();
                    let inserted_detail = inserted_detail_comp.clone();
                    Box::pin(async move {
                        let detail_id = inserted_detail.lock().unwrap().take();
                        if let Some(detail_id) = detail_id {
                            tracing::debug!(group_code = %code, "compensating enrollment detail");
                            store.delete_enrollment_detail(&detail_id).await?;
                        }
                        Ok(())
                    })
                }),
            );
        }

        for code in &group_codes {
            let store = store.clone();
            let breaker = breaker.clone();
            let code_action = code.clone();
            let code_comp = code.clone();

            steps.push(
                SagaStep::new(format!("commit_counter_{code}"), 2, move || {
                    let store = store.clone();
                    let breaker = breaker.clone();
                    let code = code_action.clone();
                    Box::pin(async move {
                        breaker
                            .call(move || {
                                let store = store.clone();
                                let code = code.clone();
                                Box::pin(async move { store.increment_group_counter(&code).await })
                            })
                            .await
                    })
                })
                .with_compensation({
                    let store = store.clone();
                    move || {
                        let store = store.clone();
                        let code = code_comp.clone();
                        Box::pin(async move { store.decrement_group_counter(&code).await })
                    }
                }),
            );
        }

        {
            let notifier = notifier.clone();
            let student_id = student_id.clone();
            steps.push(SagaStep::new("notify_confirmed", 1, move || {
                let notifier = notifier.clone();
                let student_id = student_id.clone();
                Box::pin(async move {
                    if let Err(err) = notifier.notify_confirmed("pending", &student_id).await {
                        tracing::warn!(error = %err, "enrollment confirmation notification failed");
                    }
                    Ok(())
                })
            }));
        }

        steps
    }
}
