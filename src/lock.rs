//! Distributed per-seat lock manager.
//!
//! Acquires short, auto-expiring mutual-exclusion leases keyed by
//! (ticket, row, seat) over the lease store. Acquisition across a seat set
//! is all-or-nothing: any single failure unwinds every lease already taken
//! in the call. The lock protects only the check-then-write race on seat
//! availability — the hold's lifetime is owned by the TTL'd seat-hold
//! record, not by the lock.

use crate::error::{LeaseError, ReservationError};
use crate::lease::{keys, LeaseStore};
use crate::types::{Seat, TicketId};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Locks held for one guarded region.
///
/// Returned by [`SeatLockManager::acquire_all`]; must be handed back to
/// [`SeatLockManager::release`] on every exit path of the region.
#[must_use = "seat locks must be released after the guarded region"]
pub struct SeatLockBatch {
    keys: Vec<String>,
    token: String,
}

impl SeatLockBatch {
    /// Number of seat locks in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the batch holds no locks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Acquires and releases batches of per-seat leases.
///
/// Lock granularity is per seat, so disjoint seat requests never contend.
/// Within one request, locks are taken in the caller-supplied seat order;
/// the short per-lock wait bounds how long oppositely-ordered overlapping
/// requests can contend.
#[derive(Clone)]
pub struct SeatLockManager<L: LeaseStore> {
    lease: L,
    /// Auto-expiry of a held lock; crash backstop
    lock_ttl: Duration,
    /// How long one acquisition may wait before the batch fails
    acquire_wait: Duration,
}

/// Delay between acquisition retries while waiting out a contended lock.
const RETRY_DELAY: Duration = Duration::from_millis(50);

impl<L: LeaseStore> SeatLockManager<L> {
    /// Creates a new lock manager over the given lease store.
    pub const fn new(lease: L, lock_ttl: Duration, acquire_wait: Duration) -> Self {
        Self {
            lease,
            lock_ttl,
            acquire_wait,
        }
    }

    /// Acquire leases for every seat, in order, all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`ReservationError::LockTimeout`] when any single lease cannot be
    /// won within the acquisition wait; every lease already taken in this
    /// call is released first. Lease store failures propagate likewise
    /// after unwinding.
    pub async fn acquire_all(
        &self,
        ticket_id: TicketId,
        seats: &[Seat],
    ) -> Result<SeatLockBatch, ReservationError> {
        let token = Uuid::new_v4().to_string();
        let mut held: Vec<String> = Vec::with_capacity(seats.len());

        for seat in seats {
            let key = keys::seat_lock(ticket_id, seat);
            match self.acquire_one(&key, &token).await {
                Ok(true) => held.push(key),
                Ok(false) => {
                    self.release_keys(&held, &token).await;
                    return Err(ReservationError::LockTimeout { ticket_id });
                }
                Err(e) => {
                    self.release_keys(&held, &token).await;
                    return Err(e.into());
                }
            }
        }

        Ok(SeatLockBatch { keys: held, token })
    }

    /// Release every lock in the batch. Infallible from the caller's view:
    /// a lock that cannot be deleted expires on its own TTL, so failures
    /// are logged and swallowed.
    pub async fn release(&self, batch: SeatLockBatch) {
        self.release_keys(&batch.keys, &batch.token).await;
    }

    async fn acquire_one(&self, key: &str, token: &str) -> Result<bool, LeaseError> {
        let deadline = tokio::time::Instant::now() + self.acquire_wait;
        loop {
            if self.lease.try_acquire(key, token, self.lock_ttl).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() + RETRY_DELAY > deadline {
                return Ok(false);
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn release_keys(&self, keys: &[String], token: &str) {
        for key in keys {
            if let Err(e) = self.lease.release_lock(key, token).await {
                warn!(key = %key, error = %e, "Failed to release seat lock; lease will expire on its own");
            }
        }
    }
}
