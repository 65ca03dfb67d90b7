//! Reservation Coordinator: hold, validate, release, finalize.
//!
//! The façade every workflow consumer calls. Seat-based requests run
//! through the per-seat lock manager (all-or-nothing, check-all then
//! write-all); quantity-based requests ride the atomic counter. All state
//! lives in the lease store — the durable shadow is written by the caller
//! through the repository, never from here.

use crate::error::ReservationError;
use crate::lease::{keys, LeaseStore};
use crate::lock::SeatLockManager;
use crate::types::{QuantityHold, Seat, SeatHold, TicketId, TicketRequest, UserId};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinates reservations against the lease store.
#[derive(Clone)]
pub struct ReservationCoordinator<L: LeaseStore> {
    lease: L,
    locks: SeatLockManager<L>,
    /// The authoritative hold lease window
    hold_ttl: Duration,
}

impl<L: LeaseStore> ReservationCoordinator<L> {
    /// Creates a coordinator.
    ///
    /// `hold_ttl` is the hold lease window; `lock_ttl` and `lock_wait`
    /// bound the per-seat mutual-exclusion leases (seconds, much shorter
    /// than the hold lease).
    pub fn new(lease: L, hold_ttl: Duration, lock_ttl: Duration, lock_wait: Duration) -> Self {
        let locks = SeatLockManager::new(lease.clone(), lock_ttl, lock_wait);
        Self {
            lease,
            locks,
            hold_ttl,
        }
    }

    /// The configured hold lease window.
    #[must_use]
    pub const fn hold_ttl(&self) -> Duration {
        self.hold_ttl
    }

    /// Physical TTL written on hold records. Twice the lease window: the
    /// reconciler acts on logical expiry (`reserved_at` + lease) and must
    /// find the record still alive to restore its inventory; the physical
    /// TTL only backstops a reconciler outage.
    fn record_ttl(&self) -> Duration {
        self.hold_ttl * 2
    }

    /// Seed the remaining-quantity counter for a ticket going on sale.
    ///
    /// Called by the event-approval workflow before sales open; the
    /// reserve path never auto-creates a counter.
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn seed_counter(&self, ticket_id: TicketId, total: u32) -> Result<(), ReservationError> {
        self.lease
            .set_counter(&keys::remaining_counter(ticket_id), i64::from(total))
            .await?;
        info!(ticket_id = %ticket_id, total = total, "Seeded remaining-quantity counter");
        Ok(())
    }

    /// Current remaining quantity, `None` when the counter was never
    /// seeded (defensively read as zero remaining by the reserve path).
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn remaining(&self, ticket_id: TicketId) -> Result<Option<i64>, ReservationError> {
        Ok(self
            .lease
            .get_counter(&keys::remaining_counter(ticket_id))
            .await?)
    }

    /// Hold inventory for one request.
    ///
    /// Seat-based requests acquire all seat locks, verify every requested
    /// seat is free, then write every hold — no partial writes survive a
    /// conflict. Quantity-based requests replace any existing hold for the
    /// same (ticket, user) — re-reserving is idempotent resubmission — and
    /// debit the counter atomically.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::SeatConflict`] — a requested seat is held by
    ///   someone else
    /// - [`ReservationError::InventoryIssue`] — the counter would go
    ///   negative
    /// - [`ReservationError::LockTimeout`] — seat locks not acquired in time
    /// - infrastructure failures propagate for the caller to retry
    pub async fn reserve_tickets(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        if request.has_assigned_seats() {
            self.reserve_seats(user_id, request).await
        } else {
            self.reserve_quantity(user_id, request).await
        }
    }

    /// Whether a live quantity hold exists for (ticket, user); the
    /// idempotency guard for redelivered reserve commands.
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn validate_reservation(
        &self,
        ticket_id: TicketId,
        user_id: UserId,
    ) -> Result<bool, ReservationError> {
        let hold: Option<QuantityHold> = self
            .lease
            .get_json(&keys::quantity_hold(ticket_id, user_id))
            .await?;
        Ok(hold.is_some_and(|h| !h.lease_lapsed(self.hold_ttl)))
    }

    /// Whether `user_id` owns a live hold on every seat of the request;
    /// the idempotency guard for redelivered seat-based reserve commands.
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn validate_seat_holds(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<bool, ReservationError> {
        if !request.has_assigned_seats() {
            return Ok(false);
        }
        for seat in &request.seats_chosen {
            let hold: Option<SeatHold> = self
                .lease
                .get_json(&keys::seat_hold(request.ticket_id, seat))
                .await?;
            let owned =
                hold.is_some_and(|h| h.user_id == user_id && !h.lease_lapsed(self.hold_ttl));
            if !owned {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Release a hold, restoring inventory. A no-op when the hold is
    /// already gone — releasing twice changes inventory only once.
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn release_reservation(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        if request.has_assigned_seats() {
            for seat in &request.seats_chosen {
                self.release_seat_hold(user_id, request.ticket_id, seat)
                    .await?;
            }
            return Ok(());
        }

        let counter = keys::remaining_counter(request.ticket_id);
        let hold_key = keys::quantity_hold(request.ticket_id, user_id);
        if let Some((hold, raw)) = self.read_quantity_hold(&hold_key).await? {
            let reclaimed = self
                .lease
                .reclaim_hold(&hold_key, &raw, &counter, i64::from(hold.quantity))
                .await?;
            if reclaimed {
                info!(
                    ticket_id = %request.ticket_id,
                    user_id = %user_id,
                    quantity = hold.quantity,
                    "Released quantity hold"
                );
            }
        }
        Ok(())
    }

    /// Finalize a hold at order confirmation.
    ///
    /// Seat holds become permanent bookings (their TTL is stripped);
    /// quantity holds are simply deleted — inventory was debited at hold
    /// time and is not re-touched. Safe under redelivery: absent holds are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Propagates lease store failures.
    pub async fn finalize_reservation(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        if request.has_assigned_seats() {
            for seat in &request.seats_chosen {
                let key = keys::seat_hold(request.ticket_id, seat);
                let hold: Option<SeatHold> = self.lease.get_json(&key).await?;
                match hold {
                    Some(h) if h.user_id == user_id => {
                        self.lease.persist(&key).await?;
                    }
                    Some(_) | None => {
                        debug!(
                            ticket_id = %request.ticket_id,
                            seat = %seat,
                            "No seat hold of this user to finalize; skipping"
                        );
                    }
                }
            }
            info!(
                ticket_id = %request.ticket_id,
                user_id = %user_id,
                seats = request.seats_chosen.len(),
                "Finalized seat holds into permanent bookings"
            );
            return Ok(());
        }

        let hold_key = keys::quantity_hold(request.ticket_id, user_id);
        self.lease.delete(&hold_key).await?;
        Ok(())
    }

    async fn reserve_seats(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        let batch = self
            .locks
            .acquire_all(request.ticket_id, &request.seats_chosen)
            .await?;

        // Locks are released on every exit path of the guarded region.
        let outcome = self.place_seat_holds(user_id, request).await;
        self.locks.release(batch).await;
        outcome
    }

    /// The guarded check-then-write region. Caller must hold the seat
    /// locks for every requested seat.
    async fn place_seat_holds(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        // Check all seats before writing any.
        for seat in &request.seats_chosen {
            let key = keys::seat_hold(request.ticket_id, seat);
            let existing: Option<SeatHold> = self.lease.get_json(&key).await?;
            if let Some(hold) = existing {
                // A lapsed hold no longer blocks; the holder's own hold is
                // an idempotent resubmission and gets refreshed below.
                if hold.user_id != user_id && !hold.lease_lapsed(self.hold_ttl) {
                    return Err(ReservationError::SeatConflict {
                        ticket_id: request.ticket_id,
                        seat: seat.clone(),
                    });
                }
            }
        }

        let hold = SeatHold {
            user_id,
            reserved_at: Utc::now(),
        };
        for seat in &request.seats_chosen {
            let key = keys::seat_hold(request.ticket_id, seat);
            self.lease
                .put_json(&key, &hold, Some(self.record_ttl()))
                .await?;
        }

        info!(
            ticket_id = %request.ticket_id,
            user_id = %user_id,
            seats = request.seats_chosen.len(),
            "Placed seat holds"
        );
        Ok(())
    }

    async fn reserve_quantity(
        &self,
        user_id: UserId,
        request: &TicketRequest,
    ) -> Result<(), ReservationError> {
        if request.quantity == 0 {
            return Ok(());
        }
        let counter = keys::remaining_counter(request.ticket_id);
        let hold_key = keys::quantity_hold(request.ticket_id, user_id);

        // Replace semantics: an existing hold for this (ticket, user) is
        // an idempotent resubmission. Restore its quantity before debiting
        // the new amount.
        if let Some((prior, raw)) = self.read_quantity_hold(&hold_key).await? {
            self.lease
                .reclaim_hold(&hold_key, &raw, &counter, i64::from(prior.quantity))
                .await?;
            debug!(
                ticket_id = %request.ticket_id,
                user_id = %user_id,
                prior_quantity = prior.quantity,
                "Replaced existing quantity hold"
            );
        }

        let remaining = self
            .lease
            .decr_by(&counter, i64::from(request.quantity))
            .await?;
        if remaining < 0 {
            // Revert the decrement; an unseeded counter reads as sold out.
            self.lease
                .incr_by(&counter, i64::from(request.quantity))
                .await?;
            return Err(ReservationError::InventoryIssue {
                ticket_id: request.ticket_id,
            });
        }

        let hold = QuantityHold {
            user_id,
            quantity: request.quantity,
            reserved_at: Utc::now(),
        };
        self.lease
            .put_json(&hold_key, &hold, Some(self.record_ttl()))
            .await?;

        info!(
            ticket_id = %request.ticket_id,
            user_id = %user_id,
            quantity = request.quantity,
            remaining = remaining,
            "Placed quantity hold"
        );
        Ok(())
    }

    async fn release_seat_hold(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
        seat: &Seat,
    ) -> Result<(), ReservationError> {
        let key = keys::seat_hold(ticket_id, seat);
        let Some(raw) = self.lease.get_raw(&key).await? else {
            return Ok(());
        };
        match serde_json::from_str::<SeatHold>(&raw) {
            Ok(hold) if hold.user_id == user_id => {
                // Zero quantity: seat releases never touch the counter.
                self.lease
                    .reclaim_hold(&key, &raw, &keys::remaining_counter(ticket_id), 0)
                    .await?;
            }
            Ok(_) => {
                debug!(ticket_id = %ticket_id, seat = %seat, "Seat held by someone else; leaving it");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable seat hold; deleting");
                self.lease.delete(&key).await?;
            }
        }
        Ok(())
    }

    async fn read_quantity_hold(
        &self,
        hold_key: &str,
    ) -> Result<Option<(QuantityHold, String)>, ReservationError> {
        let Some(raw) = self.lease.get_raw(hold_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<QuantityHold>(&raw) {
            Ok(hold) => Ok(Some((hold, raw))),
            Err(e) => {
                warn!(key = %hold_key, error = %e, "Undecodable quantity hold; deleting");
                self.lease.delete(hold_key).await?;
                Ok(None)
            }
        }
    }
}
