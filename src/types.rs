//! Domain types for the reservation core.
//!
//! Typed identifiers, seat coordinates, reservation requests, and the
//! cache-resident hold records that mirror durable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a ticket type (one sellable inventory pool).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId(Uuid);

impl TicketId {
    /// Creates a new random `TicketId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TicketId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a buyer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a durable reservation row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Seats
// ============================================================================

/// A single numbered seat within a ticket's venue layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seat {
    /// Row label (e.g. "A", "Balcony-3")
    pub row_name: String,
    /// Seat number within the row
    pub seat_number: u32,
}

impl Seat {
    /// Creates a new `Seat`
    #[must_use]
    pub fn new(row_name: impl Into<String>, seat_number: u32) -> Self {
        Self {
            row_name: row_name.into(),
            seat_number,
        }
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_name, self.seat_number)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A single-ticket reservation request.
///
/// `seats_chosen` empty means a quantity-based reservation against the
/// ticket's counter; non-empty means the request claims exactly those
/// numbered seats (and `quantity` equals the seat count).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    /// Ticket to reserve from
    pub ticket_id: TicketId,
    /// Number of units requested
    pub quantity: u32,
    /// Specific seats, if this ticket is seat-assigned
    pub seats_chosen: Vec<Seat>,
}

impl TicketRequest {
    /// Quantity-based request (no assigned seats).
    #[must_use]
    pub const fn quantity(ticket_id: TicketId, quantity: u32) -> Self {
        Self {
            ticket_id,
            quantity,
            seats_chosen: Vec::new(),
        }
    }

    /// Seat-based request; quantity follows from the seat count.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` seats are requested, which cannot
    /// happen for any real venue.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn seats(ticket_id: TicketId, seats: Vec<Seat>) -> Self {
        Self {
            ticket_id,
            quantity: seats.len() as u32,
            seats_chosen: seats,
        }
    }

    /// Whether this request claims specific seats.
    #[must_use]
    pub fn has_assigned_seats(&self) -> bool {
        !self.seats_chosen.is_empty()
    }
}

// ============================================================================
// Cache-resident hold records
// ============================================================================

/// A time-boxed claim on `quantity` units of a ticket, keyed by
/// (ticket, user) in the lease store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityHold {
    /// Holder
    pub user_id: UserId,
    /// Units held
    pub quantity: u32,
    /// When the hold was taken; expiry derives from this plus the hold lease
    pub reserved_at: DateTime<Utc>,
}

/// A time-boxed claim on one numbered seat, keyed by
/// (ticket, row, seat) in the lease store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatHold {
    /// Holder
    pub user_id: UserId,
    /// When the hold was taken
    pub reserved_at: DateTime<Utc>,
}

/// Logical lease expiry: the hold's age exceeds the lease window.
///
/// Expiry is judged from `reserved_at`, not from the record's physical TTL;
/// the physical TTL is a crash backstop set longer than the lease so the
/// reconciler gets to restore inventory before the record vanishes.
fn lease_lapsed(reserved_at: DateTime<Utc>, lease: std::time::Duration) -> bool {
    chrono::Duration::from_std(lease)
        .map(|window| Utc::now() - reserved_at > window)
        .unwrap_or(false)
}

impl QuantityHold {
    /// Whether this hold's lease window has elapsed.
    #[must_use]
    pub fn lease_lapsed(&self, lease: std::time::Duration) -> bool {
        lease_lapsed(self.reserved_at, lease)
    }
}

impl SeatHold {
    /// Whether this hold's lease window has elapsed.
    #[must_use]
    pub fn lease_lapsed(&self, lease: std::time::Duration) -> bool {
        lease_lapsed(self.reserved_at, lease)
    }
}

// ============================================================================
// Durable reservation status
// ============================================================================

/// Lifecycle of a durable reservation row.
///
/// `Temporary` is the only non-terminal state. Transitions out of it are
/// one-way: `Confirmed` (order confirmed), `Cancelled` (explicit cancel),
/// `Expired` (reconciler detected a lapsed lease). Re-applying a transition
/// to a terminal row is a no-op so redelivered workflow events stay safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Hold persisted, lease still running
    Temporary,
    /// Order confirmed; booking is permanent
    Confirmed,
    /// Explicitly cancelled inside the lease window
    Cancelled,
    /// Lease lapsed without confirm or cancel
    Expired,
}

impl ReservationStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Temporary)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_request_quantity_follows_seat_count() {
        let request = TicketRequest::seats(
            TicketId::new(),
            vec![Seat::new("A", 1), Seat::new("A", 2)],
        );
        assert_eq!(request.quantity, 2);
        assert!(request.has_assigned_seats());
    }

    #[test]
    fn quantity_request_has_no_seats() {
        let request = TicketRequest::quantity(TicketId::new(), 3);
        assert!(!request.has_assigned_seats());
    }

    #[test]
    fn fresh_hold_has_not_lapsed() {
        let hold = QuantityHold {
            user_id: UserId::new(),
            quantity: 2,
            reserved_at: Utc::now(),
        };
        assert!(!hold.lease_lapsed(std::time::Duration::from_secs(900)));
    }

    #[test]
    fn old_hold_has_lapsed() {
        let hold = SeatHold {
            user_id: UserId::new(),
            reserved_at: Utc::now() - chrono::Duration::minutes(20),
        };
        assert!(hold.lease_lapsed(std::time::Duration::from_secs(900)));
    }

    #[test]
    fn only_temporary_is_non_terminal() {
        assert!(!ReservationStatus::Temporary.is_terminal());
        assert!(ReservationStatus::Confirmed.is_terminal());
        assert!(ReservationStatus::Cancelled.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }
}
