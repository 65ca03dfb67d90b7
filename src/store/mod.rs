//! Durable Reservation Store: the relational shadow of cache state.
//!
//! Reservations, their items, and seat assignments persist here for crash
//! recovery and audit. The shadow is written through at hold-creation time
//! and mutated only by the explicit confirm/cancel/reconcile paths.

mod memory;
mod postgres;
pub mod schema;

pub use memory::InMemoryReservationRepository;
pub use postgres::PgReservationStore;

use crate::error::StoreError;
use crate::types::{ReservationId, TicketId, TicketRequest, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which temporary reservations a release targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Reconciler path: match reservations already past `expires_at` and
    /// mark them `Expired`.
    CleanUp,
    /// Explicit cancel path: match reservations still inside their lease
    /// and mark them `Cancelled`.
    Explicit,
}

/// Transactional contract over the durable shadow.
///
/// The ticket counter row is mutated only under a row-level lock inside a
/// transaction; any failing step rolls back the whole operation.
#[async_trait]
pub trait ReservationRepository: Clone + Send + Sync + 'static {
    /// Persist a fresh hold: defensive self-cleanup of the caller's own
    /// lapsed temporary reservation for this ticket, row-locked decrement
    /// of the durable counter, then the new reservation + item (+ seat
    /// assignments), all in one transaction.
    async fn persist_reservation(
        &self,
        user_id: UserId,
        request: &TicketRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError>;

    /// Release matching temporary reservations per `mode`, restoring each
    /// item's quantity to the row-locked ticket counter. Returns whether
    /// anything matched.
    async fn release_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
        mode: ReleaseMode,
    ) -> Result<bool, StoreError>;

    /// Mark the matching temporary reservation confirmed. Never touches
    /// the counter — inventory was debited at hold time. Returns whether
    /// anything matched (false under redelivery is a no-op, not an error).
    async fn confirm_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError>;

    /// Point-in-time idempotency guard: a temporary, unexpired reservation
    /// for (user, ticket) exists.
    async fn is_ticket_reserved(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError>;
}
