//! Error taxonomy for the reservation core.
//!
//! Failures the calling UI must tell apart (`SeatConflict` vs
//! `InventoryIssue`) are distinct variants; infrastructure failures wrap the
//! underlying store errors and propagate for the caller to retry.

use crate::types::{Seat, TicketId};
use thiserror::Error;

/// Errors from the lease (cache) layer.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The backing store rejected or failed an operation
    #[error("lease store backend error: {0}")]
    Backend(String),

    /// A stored entry could not be decoded
    #[error("failed to decode lease entry at {key}: {source}")]
    Decode {
        /// Key whose value failed to decode
        key: String,
        /// Underlying serde error
        source: serde_json::Error,
    },
}

impl From<redis::RedisError> for LeaseError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors from the durable reservation store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The ticket row does not exist
    #[error("ticket {0} not found in durable store")]
    TicketMissing(TicketId),

    /// Decrementing the durable counter would drive it negative
    #[error("insufficient durable inventory for ticket {ticket_id}: {remaining} remaining, {requested} requested")]
    InsufficientInventory {
        /// Ticket whose counter would go negative
        ticket_id: TicketId,
        /// Units left before the attempt
        remaining: i64,
        /// Units the attempt asked for
        requested: i64,
    },

    /// Database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Typed failures surfaced by the Reservation Coordinator.
#[derive(Error, Debug)]
pub enum ReservationError {
    /// A requested seat is already held or booked by someone else
    #[error("seat {seat} on ticket {ticket_id} is already held")]
    SeatConflict {
        /// Ticket the seat belongs to
        ticket_id: TicketId,
        /// First conflicting seat
        seat: Seat,
    },

    /// Not enough remaining quantity to satisfy the request
    #[error("insufficient remaining quantity for ticket {ticket_id}")]
    InventoryIssue {
        /// Sold-out (or nearly so) ticket
        ticket_id: TicketId,
    },

    /// The per-seat mutual-exclusion lease could not be acquired in time
    #[error("could not acquire seat locks for ticket {ticket_id} in time")]
    LockTimeout {
        /// Ticket whose seats were contended
        ticket_id: TicketId,
    },

    /// Lease store infrastructure failure
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Durable store infrastructure failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_conflict_names_the_seat() {
        let err = ReservationError::SeatConflict {
            ticket_id: TicketId::new(),
            seat: Seat::new("A", 1),
        };
        assert!(err.to_string().contains("A1"));
    }
}
