//! `EnrollmentStore`: the narrow transactional interface the saga calls.
//!
//! The relational data model of students, periods, groups, and enrollments
//! is out of scope for this crate (§1); the core only depends on this
//! contract. [`InMemoryEnrollmentStore`] is a full in-process test double
//! used by the workflow and saga tests, and by any caller that wants to
//! exercise the saga without a real database.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A course group's schedule: days of week plus a half-open time interval
/// `[start_minute, end_minute)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Days of week, 0 = Monday .. 6 = Sunday.
    pub days: HashSet<u8>,
    /// Start of the interval, minutes since midnight.
    pub start_minute: u32,
    /// End of the interval, minutes since midnight (exclusive).
    pub end_minute: u32,
}

impl Schedule {
    /// Whether this schedule conflicts with `other`: a shared day AND an
    /// overlapping half-open time interval.
    ///
    /// `[08:00,10:00)` and `[10:00,12:00)` on the same day are NOT
    /// conflicts; `[09:00,11:00)` and `[10:00,12:00)` ARE conflicts.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        if self.days.is_disjoint(&other.days) {
            return false;
        }
        !(self.end_minute <= other.start_minute || other.end_minute <= self.start_minute)
    }
}

/// A course group: capacity, current enrollment, subject, and schedule.
#[derive(Debug, Clone)]
pub struct Group {
    /// Group code, e.g. `G-MAT101-A`.
    pub code: String,
    /// Subject (materia) this group belongs to.
    pub materia: String,
    /// Maximum seats.
    pub capacity: u32,
    /// Currently enrolled count.
    pub current_enrolled: u32,
    /// Day/time schedule.
    pub schedule: Schedule,
}

/// An enrollment header: one per (student, period).
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Opaque enrollment id.
    pub id: String,
    /// Student id.
    pub student_id: String,
    /// Period id.
    pub period_id: String,
}

/// One group detail row under an enrollment header.
#[derive(Debug, Clone)]
pub struct EnrollmentDetail {
    /// Opaque detail id.
    pub id: String,
    /// Owning enrollment header id.
    pub enrollment_id: String,
    /// Group code.
    pub group_code: String,
}

/// Transactional operations the saga requires. Each implementer wraps its
/// calls with the `database` circuit breaker (§6.3); that wiring lives in
/// [`crate::workflow`], not here.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Validate the student exists and is not blocked.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] or [`CoreError::StudentBlocked`].
    async fn validate_student_active(&self, student_id: &str) -> Result<()>;

    /// Validate the period exists and is active.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] or [`CoreError::PeriodInactive`].
    async fn validate_period_active(&self, period_id: &str) -> Result<()>;

    /// Look up an existing enrollment header for (student, period).
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn lookup_existing_enrollment(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Option<Enrollment>>;

    /// Insert a fresh enrollment header, guarded by a unique
    /// (student, period) constraint.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn insert_enrollment_header(&self, student_id: &str, period_id: &str) -> Result<String>;

    /// Delete an enrollment header. Idempotent.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn delete_enrollment_header(&self, enrollment_id: &str) -> Result<()>;

    /// Whether a detail row already exists for (enrollment, group).
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn has_detail_for_group(&self, enrollment_id: &str, group_code: &str) -> Result<bool>;

    /// Insert an enrollment detail row.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn insert_enrollment_detail(
        &self,
        enrollment_id: &str,
        group_code: &str,
    ) -> Result<String>;

    /// Delete an enrollment detail row. Idempotent.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn delete_enrollment_detail(&self, detail_id: &str) -> Result<()>;

    /// Atomically increment a group's enrolled counter under a row lock,
    /// checking `current < capacity` first.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] or [`CoreError::CapacityExhausted`].
    async fn increment_group_counter(&self, group_code: &str) -> Result<()>;

    /// Decrement a group's counter, clamped at zero. Idempotent.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn decrement_group_counter(&self, group_code: &str) -> Result<()>;

    /// Fetch the subject code for a group.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] if the group does not exist.
    async fn get_group_materia(&self, group_code: &str) -> Result<String>;

    /// Fetch the set of subjects the student already holds a group for in
    /// this period.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn student_enrolled_materias(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<HashSet<String>>;

    /// Check `group_code`'s schedule against every code in
    /// `other_group_codes`; returns the first conflicting code, if any.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] if `group_code` does not exist.
    async fn schedule_conflict(
        &self,
        group_code: &str,
        other_group_codes: &[String],
    ) -> Result<Option<String>>;

    /// Fetch the group codes the student already holds a detail row for in
    /// this period, so a new request's schedule-conflict check can be run
    /// against the union of those and the groups being requested.
    ///
    /// # Errors
    /// Returns an error on store failure.
    async fn student_enrolled_group_codes(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Vec<String>>;
}

#[derive(Default)]
struct StoreState {
    students_blocked: HashSet<String>,
    students: HashSet<String>,
    periods_active: HashMap<String, bool>,
    groups: HashMap<String, Group>,
    enrollments: HashMap<String, Enrollment>,
    enrollments_by_student_period: HashMap<(String, String), String>,
    details: HashMap<String, EnrollmentDetail>,
    details_by_enrollment: HashMap<String, Vec<String>>,
    next_id: u64,
}

/// A fully in-process [`EnrollmentStore`] for tests.
///
/// Seed it with [`InMemoryEnrollmentStore::seed_group`] /
/// [`InMemoryEnrollmentStore::seed_student`] /
/// [`InMemoryEnrollmentStore::seed_period`] before running a saga against
/// it.
pub struct InMemoryEnrollmentStore {
    state: Mutex<StoreState>,
}

impl InMemoryEnrollmentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }

    /// Register a student as active (and not blocked).
    pub fn seed_student(&self, student_id: impl Into<String>) {
        self.lock().students.insert(student_id.into());
    }

    /// Mark a student as blocked.
    pub fn seed_blocked_student(&self, student_id: impl Into<String>) {
        let mut state = self.lock();
        let id = student_id.into();
        state.students.insert(id.clone());
        state.students_blocked.insert(id);
    }

    /// Register a period as active or inactive.
    pub fn seed_period(&self, period_id: impl Into<String>, active: bool) {
        self.lock().periods_active.insert(period_id.into(), active);
    }

    /// Register a group with its capacity, subject, and schedule.
    pub fn seed_group(&self, group: Group) {
        self.lock().groups.insert(group.code.clone(), group);
    }

    /// Current enrolled count for a group, for test assertions.
    #[must_use]
    pub fn current_enrolled(&self, group_code: &str) -> Option<u32> {
        self.lock().groups.get(group_code).map(|g| g.current_enrolled)
    }

    /// Number of detail rows persisted for a group, for test assertions.
    #[must_use]
    pub fn detail_count_for_group(&self, group_code: &str) -> usize {
        self.lock()
            .details
            .values()
            .filter(|d| d.group_code == group_code)
            .count()
    }
}

impl Default for InMemoryEnrollmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryEnrollmentStore {
    async fn validate_student_active(&self, student_id: &str) -> Result<()> {
        let state = self.lock();
        if !state.students.contains(student_id) {
            return Err(CoreError::NotFound {
                what: format!("student {student_id}"),
            });
        }
        if state.students_blocked.contains(student_id) {
            return Err(CoreError::StudentBlocked {
                reason: format!("student {student_id} is blocked"),
            });
        }
        Ok(())
    }

    async fn validate_period_active(&self, period_id: &str) -> Result<()> {
        match self.lock().periods_active.get(period_id) {
            Some(true) => Ok(()),
            Some(false) => Err(CoreError::PeriodInactive {
                period_id: period_id.to_string(),
            }),
            None => Err(CoreError::NotFound {
                what: format!("period {period_id}"),
            }),
        }
    }

    async fn lookup_existing_enrollment(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Option<Enrollment>> {
        let state = self.lock();
        Ok(state
            .enrollments_by_student_period
            .get(&(student_id.to_string(), period_id.to_string()))
            .and_then(|id| state.enrollments.get(id))
            .cloned())
    }

    async fn insert_enrollment_header(&self, student_id: &str, period_id: &str) -> Result<String> {
        let id = self.next_id("enr");
        let mut state = self.lock();
        let key = (student_id.to_string(), period_id.to_string());
        if state.enrollments_by_student_period.contains_key(&key) {
            return Err(CoreError::Invariant(format!(
                "enrollment header already exists for {student_id}/{period_id}"
            )));
        }
        state.enrollments.insert(
            id.clone(),
            Enrollment {
                id: id.clone(),
                student_id: student_id.to_string(),
                period_id: period_id.to_string(),
            },
        );
        state.enrollments_by_student_period.insert(key, id.clone());
        Ok(id)
    }

    async fn delete_enrollment_header(&self, enrollment_id: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(enrollment) = state.enrollments.remove(enrollment_id) {
            state
                .enrollments_by_student_period
                .remove(&(enrollment.student_id, enrollment.period_id));
        }
        state.details_by_enrollment.remove(enrollment_id);
        Ok(())
    }

    async fn has_detail_for_group(&self, enrollment_id: &str, group_code: &str) -> Result<bool> {
        let state = self.lock();
        Ok(state
            .details_by_enrollment
            .get(enrollment_id)
            .is_some_and(|ids| {
                ids.iter()
                    .any(|id| state.details.get(id).is_some_and(|d| d.group_code == group_code))
            }))
    }

    async fn insert_enrollment_detail(
        &self,
        enrollment_id: &str,
        group_code: &str,
    ) -> Result<String> {
        let id = self.next_id("det");
        let mut state = self.lock();
        state.details.insert(
            id.clone(),
            EnrollmentDetail {
                id: id.clone(),
                enrollment_id: enrollment_id.to_string(),
                group_code: group_code.to_string(),
            },
        );
        state
            .details_by_enrollment
            .entry(enrollment_id.to_string())
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    async fn delete_enrollment_detail(&self, detail_id: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(detail) = state.details.remove(detail_id) {
            if let Some(ids) = state.details_by_enrollment.get_mut(&detail.enrollment_id) {
                ids.retain(|id| id != detail_id);
            }
        }
        Ok(())
    }

    async fn increment_group_counter(&self, group_code: &str) -> Result<()> {
        let mut state = self.lock();
        let group = state
            .groups
            .get_mut(group_code)
            .ok_or_else(|| CoreError::NotFound {
                what: format!("group {group_code}"),
            })?;
        if group.current_enrolled >= group.capacity {
            return Err(CoreError::CapacityExhausted {
                group_code: group_code.to_string(),
            });
        }
        group.current_enrolled += 1;
        Ok(())
    }

    async fn decrement_group_counter(&self, group_code: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(group) = state.groups.get_mut(group_code) {
            group.current_enrolled = group.current_enrolled.saturating_sub(1);
        }
        Ok(())
    }

    async fn get_group_materia(&self, group_code: &str) -> Result<String> {
        self.lock()
            .groups
            .get(group_code)
            .map(|g| g.materia.clone())
            .ok_or_else(|| CoreError::NotFound {
                what: format!("group {group_code}"),
            })
    }

    async fn student_enrolled_materias(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<HashSet<String>> {
        let state = self.lock();
        let Some(enrollment_id) = state
            .enrollments_by_student_period
            .get(&(student_id.to_string(), period_id.to_string()))
        else {
            return Ok(HashSet::new());
        };
        let Some(detail_ids) = state.details_by_enrollment.get(enrollment_id) else {
            return Ok(HashSet::new());
        };
        Ok(detail_ids
            .iter()
            .filter_map(|id| state.details.get(id))
            .filter_map(|d| state.groups.get(&d.group_code))
            .map(|g| g.materia.clone())
            .collect())
    }

    async fn schedule_conflict(
        &self,
        group_code: &str,
        other_group_codes: &[String],
    ) -> Result<Option<String>> {
        let state = self.lock();
        let group = state
            .groups
            .get(group_code)
            .ok_or_else(|| CoreError::NotFound {
                what: format!("group {group_code}"),
            })?;
        for other_code in other_group_codes {
            if other_code == group_code {
                continue;
            }
            if let Some(other) = state.groups.get(other_code) {
                if group.schedule.conflicts_with(&other.schedule) {
                    return Ok(Some(other_code.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn student_enrolled_group_codes(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Vec<String>> {
        let state = self.lock();
        let Some(enrollment_id) = state
            .enrollments_by_student_period
            .get(&(student_id.to_string(), period_id.to_string()))
        else {
            return Ok(Vec::new());
        };
        let Some(detail_ids) = state.details_by_enrollment.get(enrollment_id) else {
            return Ok(Vec::new());
        };
        Ok(detail_ids
            .iter()
            .filter_map(|id| state.details.get(id))
            .map(|d| d.group_code.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn schedule(days: &[u8], start: u32, end: u32) -> Schedule {
        Schedule {
            days: days.iter().copied().collect(),
            start_minute: start,
            end_minute: end,
        }
    }

    #[test]
    fn adjacent_intervals_on_same_day_do_not_conflict() {
        let a = schedule(&[0], 8 * 60, 10 * 60);
        let b = schedule(&[0], 10 * 60, 12 * 60);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn overlapping_intervals_on_same_day_conflict() {
        let a = schedule(&[0], 9 * 60, 11 * 60);
        let b = schedule(&[0], 10 * 60, 12 * 60);
        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn disjoint_days_never_conflict() {
        let a = schedule(&[0], 9 * 60, 11 * 60);
        let b = schedule(&[1], 9 * 60, 11 * 60);
        assert!(!a.conflicts_with(&b));
    }

    #[tokio::test]
    async fn increment_respects_capacity() {
        let store = InMemoryEnrollmentStore::new();
        store.seed_group(Group {
            code: "G1".to_string(),
            materia: "MAT101".to_string(),
            capacity: 1,
            current_enrolled: 0,
            schedule: schedule(&[0], 8 * 60, 10 * 60),
        });
        store.increment_group_counter("G1").await.unwrap();
        let result = store.increment_group_counter("G1").await;
        assert!(matches!(result, Err(CoreError::CapacityExhausted { .. })));
        assert_eq!(store.current_enrolled("G1"), Some(1));
    }

    #[tokio::test]
    async fn decrement_is_clamped_at_zero() {
        let store = InMemoryEnrollmentStore::new();
        store.seed_group(Group {
            code: "G1".to_string(),
            materia: "MAT101".to_string(),
            capacity: 5,
            current_enrolled: 0,
            schedule: schedule(&[0], 8 * 60, 10 * 60),
        });
        store.decrement_group_counter("G1").await.unwrap();
        assert_eq!(store.current_enrolled("G1"), Some(0));
    }

    #[tokio::test]
    async fn blocked_student_is_rejected() {
        let store = InMemoryEnrollmentStore::new();
        store.seed_blocked_student("RA9999");
        let result = store.validate_student_active("RA9999").await;
        assert!(matches!(result, Err(CoreError::StudentBlocked { .. })));
    }

    proptest! {
        /// Invariant 7: conflict detection is symmetric regardless of which
        /// schedule is the receiver and which is the argument.
        #[test]
        fn schedule_conflict_is_symmetric(
            days_a in prop::collection::hash_set(0u8..7, 0..7),
            start_a in 0u32..1440,
            len_a in 1u32..600,
            days_b in prop::collection::hash_set(0u8..7, 0..7),
            start_b in 0u32..1440,
            len_b in 1u32..600,
        ) {
            let a = Schedule { days: days_a, start_minute: start_a, end_minute: start_a + len_a };
            let b = Schedule { days: days_b, start_minute: start_b, end_minute: start_b + len_b };
            prop_assert_eq!(a.conflicts_with(&b), b.conflicts_with(&a));
        }
    }
}
