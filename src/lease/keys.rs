//! Key namespaces for the lease store.
//!
//! All cache-resident state lives under four namespaces:
//!
//! - `ticket:{ticket_id}:remaining` — atomic quantity counter
//! - `hold:qty:{ticket_id}:{user_id}` — quantity hold, TTL-bearing
//! - `hold:seat:{ticket_id}:{row}:{seat}` — seat hold, TTL-bearing until
//!   finalized
//! - `lock:seat:{ticket_id}:{row}:{seat}` — short mutual-exclusion lease

use crate::types::{Seat, TicketId, UserId};
use uuid::Uuid;

/// Scan pattern matching every quantity hold.
pub const QUANTITY_HOLD_PATTERN: &str = "hold:qty:*";

/// Scan pattern matching every seat hold.
pub const SEAT_HOLD_PATTERN: &str = "hold:seat:*";

/// Counter key for a ticket's remaining quantity.
#[must_use]
pub fn remaining_counter(ticket_id: TicketId) -> String {
    format!("ticket:{ticket_id}:remaining")
}

/// Quantity-hold key for a (ticket, user) pair.
#[must_use]
pub fn quantity_hold(ticket_id: TicketId, user_id: UserId) -> String {
    format!("hold:qty:{ticket_id}:{user_id}")
}

/// Seat-hold key for one numbered seat.
#[must_use]
pub fn seat_hold(ticket_id: TicketId, seat: &Seat) -> String {
    format!(
        "hold:seat:{ticket_id}:{}:{}",
        seat.row_name, seat.seat_number
    )
}

/// Seat-lock key for one numbered seat.
#[must_use]
pub fn seat_lock(ticket_id: TicketId, seat: &Seat) -> String {
    format!(
        "lock:seat:{ticket_id}:{}:{}",
        seat.row_name, seat.seat_number
    )
}

/// Recover (ticket, user) from a quantity-hold key.
///
/// Returns `None` for keys outside the namespace or with malformed ids;
/// the reconciler skips those rather than failing the sweep.
#[must_use]
pub fn parse_quantity_hold(key: &str) -> Option<(TicketId, UserId)> {
    let rest = key.strip_prefix("hold:qty:")?;
    let (ticket, user) = rest.split_once(':')?;
    let ticket_id = TicketId::from_uuid(Uuid::parse_str(ticket).ok()?);
    let user_id = UserId::from_uuid(Uuid::parse_str(user).ok()?);
    Some((ticket_id, user_id))
}

/// Recover the ticket id from a seat-hold key.
///
/// The row name may itself contain `:`; only the leading ticket segment is
/// parsed.
#[must_use]
pub fn parse_seat_hold_ticket(key: &str) -> Option<TicketId> {
    let rest = key.strip_prefix("hold:seat:")?;
    let (ticket, _) = rest.split_once(':')?;
    Some(TicketId::from_uuid(Uuid::parse_str(ticket).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_hold_key_parses_back() {
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        let key = quantity_hold(ticket_id, user_id);
        assert_eq!(parse_quantity_hold(&key), Some((ticket_id, user_id)));
    }

    #[test]
    fn seat_hold_key_parses_ticket_even_with_odd_row_names() {
        let ticket_id = TicketId::new();
        let seat = Seat::new("Balcony:Left", 12);
        let key = seat_hold(ticket_id, &seat);
        assert_eq!(parse_seat_hold_ticket(&key), Some(ticket_id));
    }

    #[test]
    fn foreign_keys_do_not_parse() {
        assert_eq!(parse_quantity_hold("session:abc"), None);
        assert_eq!(parse_quantity_hold("hold:qty:not-a-uuid:also-not"), None);
        assert_eq!(parse_seat_hold_ticket("hold:qty:x:y"), None);
    }
}
