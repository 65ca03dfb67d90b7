//! Wire messages for the reservation workflows.
//!
//! Commands arrive as JSON over the command topics; the reserve workflow
//! gets a reply envelope, the confirm/cancel workflows are fire-and-forget.

use crate::error::ReservationError;
use crate::types::{Seat, TicketId, TicketRequest, UserId};
use serde::{Deserialize, Serialize};

/// Request to hold inventory for one buyer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveTicketsCommand {
    /// Buyer placing the hold
    pub user_id: UserId,
    /// What to hold
    pub ticket: TicketRequest,
}

/// Order outcome: every line of the order was paid for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    /// Buyer whose order completed
    pub user_id: UserId,
    /// The order's reserved lines
    pub lines: Vec<TicketRequest>,
}

/// Order outcome: the buyer backed out inside the lease window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Buyer whose order was abandoned
    pub user_id: UserId,
    /// The order's reserved lines
    pub lines: Vec<TicketRequest>,
}

/// Why a reserve command failed, in terms the requesting UI can act on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A requested seat is held by someone else
    SeatConflict {
        /// Ticket the seat belongs to
        ticket_id: TicketId,
        /// First conflicting seat
        seat: Seat,
    },
    /// Not enough remaining quantity
    InventoryIssue {
        /// Sold-out ticket
        ticket_id: TicketId,
    },
    /// Seat locks could not be acquired in time; worth retrying
    LockTimeout {
        /// Contended ticket
        ticket_id: TicketId,
    },
    /// Infrastructure failure; worth retrying
    UnhandledException,
}

impl From<&ReservationError> for FailureKind {
    fn from(err: &ReservationError) -> Self {
        match err {
            ReservationError::SeatConflict { ticket_id, seat } => Self::SeatConflict {
                ticket_id: *ticket_id,
                seat: seat.clone(),
            },
            ReservationError::InventoryIssue { ticket_id } => Self::InventoryIssue {
                ticket_id: *ticket_id,
            },
            ReservationError::LockTimeout { ticket_id } => Self::LockTimeout {
                ticket_id: *ticket_id,
            },
            ReservationError::Lease(_) | ReservationError::Store(_) => Self::UnhandledException,
        }
    }
}

/// Reply envelope for a reserve command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveReply {
    /// Buyer the reply is for
    pub user_id: UserId,
    /// Ticket the command targeted
    pub ticket_id: TicketId,
    /// Whether the hold was placed
    pub success: bool,
    /// Populated when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ReserveReply {
    /// Successful hold.
    #[must_use]
    pub const fn ok(user_id: UserId, ticket_id: TicketId) -> Self {
        Self {
            user_id,
            ticket_id,
            success: true,
            failure: None,
        }
    }

    /// Failed hold with its typed cause.
    #[must_use]
    pub const fn failed(user_id: UserId, ticket_id: TicketId, failure: FailureKind) -> Self {
        Self {
            user_id,
            ticket_id,
            success: false,
            failure: Some(failure),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_tags_are_stable() {
        let failure = FailureKind::InventoryIssue {
            ticket_id: TicketId::new(),
        };
        let json = serde_json::to_string(&failure).expect("serialize");
        assert!(json.contains(r#""kind":"inventory_issue""#));
    }

    #[test]
    fn infrastructure_errors_map_to_unhandled() {
        let err = ReservationError::Lease(crate::error::LeaseError::Backend("down".into()));
        assert_eq!(FailureKind::from(&err), FailureKind::UnhandledException);
    }
}
