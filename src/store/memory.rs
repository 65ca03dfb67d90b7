//! In-memory reservation repository for tests.
//!
//! Mirrors the transactional semantics of the Postgres store under one
//! mutex: an operation either applies completely or not at all.

use crate::error::StoreError;
use crate::store::{ReleaseMode, ReservationRepository};
use crate::types::{
    ReservationId, ReservationStatus, Seat, TicketId, TicketRequest, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Debug)]
struct ReservationRecord {
    id: ReservationId,
    user_id: UserId,
    ticket_id: TicketId,
    quantity: u32,
    #[allow(dead_code)]
    seats: Vec<Seat>,
    expires_at: DateTime<Utc>,
    status: ReservationStatus,
}

#[derive(Default)]
struct State {
    tickets: HashMap<TicketId, i64>,
    reservations: Vec<ReservationRecord>,
}

/// In-memory [`ReservationRepository`] sharing state across clones.
#[derive(Clone, Default)]
pub struct InMemoryReservationRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryReservationRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Insert (or reset) a ticket with its full quantity.
    pub fn create_ticket(&self, ticket_id: TicketId, total: u32) {
        self.with_state(|state| {
            state.tickets.insert(ticket_id, i64::from(total));
        });
    }

    /// Durable remaining count, `None` when the ticket is unknown.
    #[must_use]
    pub fn remaining_count(&self, ticket_id: TicketId) -> Option<i64> {
        self.with_state(|state| state.tickets.get(&ticket_id).copied())
    }

    /// Statuses of every reservation for (user, ticket), in creation order.
    #[must_use]
    pub fn statuses(&self, user_id: UserId, ticket_id: TicketId) -> Vec<ReservationStatus> {
        self.with_state(|state| {
            state
                .reservations
                .iter()
                .filter(|r| r.user_id == user_id && r.ticket_id == ticket_id)
                .map(|r| r.status)
                .collect()
        })
    }
}

#[async_trait]
impl ReservationRepository for InMemoryReservationRepository {
    async fn persist_reservation(
        &self,
        user_id: UserId,
        request: &TicketRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError> {
        self.with_state(|state| {
            let now = Utc::now();

            // Defensive self-cleanup of the caller's lapsed temporary
            // reservation for this ticket, before any checks.
            let mut restored: i64 = 0;
            state.reservations.retain(|r| {
                let stale = r.user_id == user_id
                    && r.ticket_id == request.ticket_id
                    && r.status == ReservationStatus::Temporary
                    && r.expires_at <= now;
                if stale {
                    restored += i64::from(r.quantity);
                }
                !stale
            });
            if restored > 0 {
                if let Some(count) = state.tickets.get_mut(&request.ticket_id) {
                    *count += restored;
                }
            }

            let Some(remaining) = state.tickets.get_mut(&request.ticket_id) else {
                return Err(StoreError::TicketMissing(request.ticket_id));
            };
            let requested = i64::from(request.quantity);
            if *remaining < requested {
                return Err(StoreError::InsufficientInventory {
                    ticket_id: request.ticket_id,
                    remaining: *remaining,
                    requested,
                });
            }
            *remaining -= requested;

            let record = ReservationRecord {
                id: ReservationId::new(),
                user_id,
                ticket_id: request.ticket_id,
                quantity: request.quantity,
                seats: request.seats_chosen.clone(),
                expires_at,
                status: ReservationStatus::Temporary,
            };
            let id = record.id;
            state.reservations.push(record);
            Ok(id)
        })
    }

    async fn release_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
        mode: ReleaseMode,
    ) -> Result<bool, StoreError> {
        self.with_state(|state| {
            let now = Utc::now();
            let new_status = match mode {
                ReleaseMode::CleanUp => ReservationStatus::Expired,
                ReleaseMode::Explicit => ReservationStatus::Cancelled,
            };

            let mut restored: i64 = 0;
            let mut found = false;
            for record in &mut state.reservations {
                if record.user_id != user_id
                    || record.ticket_id != ticket_id
                    || record.status != ReservationStatus::Temporary
                {
                    continue;
                }
                let matches = match mode {
                    ReleaseMode::CleanUp => record.expires_at <= now,
                    ReleaseMode::Explicit => record.expires_at > now,
                };
                if matches {
                    record.status = new_status;
                    restored += i64::from(record.quantity);
                    found = true;
                }
            }
            if restored > 0 {
                if let Some(count) = state.tickets.get_mut(&ticket_id) {
                    *count += restored;
                }
            }
            Ok(found)
        })
    }

    async fn confirm_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError> {
        self.with_state(|state| {
            let mut found = false;
            for record in &mut state.reservations {
                if record.user_id == user_id
                    && record.ticket_id == ticket_id
                    && record.status == ReservationStatus::Temporary
                {
                    record.status = ReservationStatus::Confirmed;
                    found = true;
                }
            }
            Ok(found)
        })
    }

    async fn is_ticket_reserved(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError> {
        self.with_state(|state| {
            let now = Utc::now();
            Ok(state.reservations.iter().any(|r| {
                r.user_id == user_id
                    && r.ticket_id == ticket_id
                    && r.status == ReservationStatus::Temporary
                    && r.expires_at > now
            }))
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_is_idempotent_and_leaves_the_counter_alone() {
        let repo = InMemoryReservationRepository::new();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        repo.create_ticket(ticket_id, 5);

        repo.persist_reservation(
            user_id,
            &TicketRequest::quantity(ticket_id, 2),
            Utc::now() + chrono::Duration::minutes(15),
        )
        .await
        .expect("persist");
        assert_eq!(repo.remaining_count(ticket_id), Some(3));

        assert!(repo
            .confirm_reservation(user_id, ticket_id)
            .await
            .expect("confirm"));
        // Redelivery: already terminal, nothing matches, no error.
        assert!(!repo
            .confirm_reservation(user_id, ticket_id)
            .await
            .expect("confirm again"));
        assert_eq!(repo.remaining_count(ticket_id), Some(3));
    }

    #[tokio::test]
    async fn cleanup_release_only_matches_lapsed_reservations() {
        let repo = InMemoryReservationRepository::new();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        repo.create_ticket(ticket_id, 5);

        repo.persist_reservation(
            user_id,
            &TicketRequest::quantity(ticket_id, 2),
            Utc::now() + chrono::Duration::minutes(15),
        )
        .await
        .expect("persist");

        // Still inside its lease: the reconciler path must not touch it.
        assert!(!repo
            .release_reservation(user_id, ticket_id, ReleaseMode::CleanUp)
            .await
            .expect("cleanup"));
        // The explicit cancel path does.
        assert!(repo
            .release_reservation(user_id, ticket_id, ReleaseMode::Explicit)
            .await
            .expect("cancel"));
        assert_eq!(repo.remaining_count(ticket_id), Some(5));
        assert_eq!(
            repo.statuses(user_id, ticket_id),
            vec![ReservationStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn persist_cleans_up_own_stale_reservation_first() {
        let repo = InMemoryReservationRepository::new();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        repo.create_ticket(ticket_id, 5);

        // A reservation whose lease already lapsed.
        repo.persist_reservation(
            user_id,
            &TicketRequest::quantity(ticket_id, 3),
            Utc::now() - chrono::Duration::minutes(1),
        )
        .await
        .expect("persist stale");
        assert_eq!(repo.remaining_count(ticket_id), Some(2));

        // Re-reserving restores the stale quantity before debiting anew.
        repo.persist_reservation(
            user_id,
            &TicketRequest::quantity(ticket_id, 4),
            Utc::now() + chrono::Duration::minutes(15),
        )
        .await
        .expect("persist fresh");
        assert_eq!(repo.remaining_count(ticket_id), Some(1));
    }
}
