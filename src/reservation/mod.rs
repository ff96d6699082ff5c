//! Distributed short-TTL advisory lock per group code.
//!
//! Correctness lives in the row-lock + capacity check of
//! `EnrollmentStore::increment_group_counter` (§4.5/§4.7); this lock is a
//! performance optimization that avoids wasted work under contention, not
//! the correctness boundary. Tests must cover the case where the
//! reservation is bypassed or expires mid-saga and confirm capacity is
//! still respected.

use crate::error::{CoreError, Result};
use crate::kv::KVStore;
use std::time::Duration;

fn lock_key(group_code: &str) -> String {
    format!("lock:group:{group_code}")
}

/// A set of acquired group locks, released together.
pub struct ReservationHandle {
    holder: String,
    group_codes: Vec<String>,
}

impl ReservationHandle {
    /// The group codes held by this reservation.
    #[must_use]
    pub fn group_codes(&self) -> &[String] {
        &self.group_codes
    }
}

/// Acquires and releases per-group advisory locks over a [`KVStore`].
pub struct GroupReservation<'a, S: KVStore> {
    store: &'a S,
}

impl<'a, S: KVStore> GroupReservation<'a, S> {
    /// Wrap a `KVStore` as a group reservation service.
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Attempt to acquire a lock on every code in `group_codes`.
    ///
    /// On the first conflict, releases every previously acquired lock (in
    /// reverse order) and returns [`CoreError::ReservationConflict`].
    /// Handles are not re-entrant: reserving the same code twice without an
    /// intervening release always conflicts.
    ///
    /// # Errors
    /// Returns [`CoreError::ReservationConflict`] if any code is already
    /// held, or a transient error on backend failure.
    pub async fn reserve(
        &self,
        holder: &str,
        group_codes: &[String],
        ttl: Duration,
    ) -> Result<ReservationHandle> {
        let mut acquired = Vec::with_capacity(group_codes.len());
        for code in group_codes {
            let key = lock_key(code);
            let got = self
                .store
                .set_if_absent(&key, holder.as_bytes().to_vec(), ttl)
                .await?;
            if got {
                acquired.push(code.clone());
                tracing::debug!(group_code = %code, holder, "group reservation acquired");
            } else {
                tracing::warn!(group_code = %code, holder, "group reservation conflict");
                for held in acquired.iter().rev() {
                    let _ = self.store.delete(&lock_key(held)).await;
                }
                return Err(CoreError::ReservationConflict {
                    group_code: code.clone(),
                });
            }
        }
        Ok(ReservationHandle {
            holder: holder.to_string(),
            group_codes: acquired,
        })
    }

    /// Release every lock held by `handle`.
    ///
    /// # Errors
    /// Returns an error on backend failure; a key already expired is not an
    /// error.
    pub async fn release(&self, handle: &ReservationHandle) -> Result<()> {
        for code in &handle.group_codes {
            self.store.delete(&lock_key(code)).await?;
        }
        tracing::debug!(holder = %handle.holder, groups = ?handle.group_codes, "group reservation released");
        Ok(())
    }
}
