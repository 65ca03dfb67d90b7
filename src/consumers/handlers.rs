//! Workflow handlers behind the command topics.
//!
//! Each handler owns the full unit of work for one message: cache mutation
//! through the coordinator, then the durable shadow through the repository.
//! The reserve path compensates the cache when the shadow write fails so a
//! buyer never keeps a hold the database refused.

use crate::consumers::kafka::MessageHandler;
use crate::consumers::messages::{
    FailureKind, OrderCancelled, OrderConfirmed, ReserveReply, ReserveTicketsCommand,
};
use crate::coordinator::ReservationCoordinator;
use crate::error::{ReservationError, StoreError};
use crate::lease::LeaseStore;
use crate::store::{ReleaseMode, ReservationRepository};
use crate::types::{TicketRequest, UserId};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Handles `ReserveTicketsCommand`: place the hold, write the shadow,
/// produce a reply envelope.
#[derive(Clone)]
pub struct ReserveHandler<L: LeaseStore, R: ReservationRepository> {
    coordinator: ReservationCoordinator<L>,
    repository: R,
}

impl<L: LeaseStore, R: ReservationRepository> ReserveHandler<L, R> {
    /// Creates a reserve handler.
    pub const fn new(coordinator: ReservationCoordinator<L>, repository: R) -> Self {
        Self {
            coordinator,
            repository,
        }
    }

    /// Full unit of work for one reserve command. Always produces a reply.
    pub async fn process(&self, command: &ReserveTicketsCommand) -> ReserveReply {
        let user_id = command.user_id;
        let ticket_id = command.ticket.ticket_id;

        // Redelivery guard: live cache holds for the whole request plus a
        // live shadow row mean this command already succeeded. Without it
        // a redelivered command would re-persist and debit the durable
        // counter a second time.
        match self.already_reserved(command).await {
            Ok(true) => {
                info!(
                    ticket_id = %ticket_id,
                    user_id = %user_id,
                    "Reserve command already applied; replying success"
                );
                return ReserveReply::ok(user_id, ticket_id);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Redelivery guard failed; processing command anyway");
            }
        }

        if let Err(e) = self
            .coordinator
            .reserve_tickets(user_id, &command.ticket)
            .await
        {
            warn!(
                ticket_id = %ticket_id,
                user_id = %user_id,
                error = %e,
                "Reserve command failed in the lease store"
            );
            return ReserveReply::failed(user_id, ticket_id, FailureKind::from(&e));
        }

        let expires_at = Utc::now() + self.lease_window();
        match self
            .repository
            .persist_reservation(user_id, &command.ticket, expires_at)
            .await
        {
            Ok(reservation_id) => {
                info!(
                    reservation_id = %reservation_id,
                    ticket_id = %ticket_id,
                    user_id = %user_id,
                    "Reserve command completed"
                );
                ReserveReply::ok(user_id, ticket_id)
            }
            Err(e) => {
                error!(
                    ticket_id = %ticket_id,
                    user_id = %user_id,
                    error = %e,
                    "Durable write failed after hold placement; compensating"
                );
                if let Err(release_err) = self
                    .coordinator
                    .release_reservation(user_id, &command.ticket)
                    .await
                {
                    error!(
                        ticket_id = %ticket_id,
                        user_id = %user_id,
                        error = %release_err,
                        "Compensating release failed; reconciler will reclaim the hold"
                    );
                }
                let failure = match &e {
                    StoreError::TicketMissing(_) | StoreError::InsufficientInventory { .. } => {
                        FailureKind::InventoryIssue { ticket_id }
                    }
                    StoreError::Database(_) => FailureKind::UnhandledException,
                };
                ReserveReply::failed(user_id, ticket_id, failure)
            }
        }
    }

    async fn already_reserved(
        &self,
        command: &ReserveTicketsCommand,
    ) -> Result<bool, ReservationError> {
        let held = if command.ticket.has_assigned_seats() {
            self.coordinator
                .validate_seat_holds(command.user_id, &command.ticket)
                .await?
        } else {
            self.coordinator
                .validate_reservation(command.ticket.ticket_id, command.user_id)
                .await?
        };
        if !held {
            return Ok(false);
        }
        let shadowed = self
            .repository
            .is_ticket_reserved(command.user_id, command.ticket.ticket_id)
            .await
            .map_err(ReservationError::from)?;
        Ok(shadowed)
    }

    fn lease_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.coordinator.hold_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(900))
    }
}

/// Handles `OrderConfirmed`: finalize every line's holds and confirm the
/// shadow rows.
#[derive(Clone)]
pub struct ConfirmHandler<L: LeaseStore, R: ReservationRepository> {
    coordinator: ReservationCoordinator<L>,
    repository: R,
}

impl<L: LeaseStore, R: ReservationRepository> ConfirmHandler<L, R> {
    /// Creates a confirm handler.
    pub const fn new(coordinator: ReservationCoordinator<L>, repository: R) -> Self {
        Self {
            coordinator,
            repository,
        }
    }

    /// Apply one order confirmation. Each line is its own unit of work: a
    /// failing line is logged and skipped so the lines after it still
    /// confirm, and the failed line stays temporary for a later retry or
    /// the reconciler.
    pub async fn process(&self, event: &OrderConfirmed) {
        for line in &event.lines {
            if let Err(e) = self.confirm_line(event.user_id, line).await {
                error!(
                    ticket_id = %line.ticket_id,
                    user_id = %event.user_id,
                    error = %e,
                    "Failed to confirm order line; continuing with the rest"
                );
            }
        }
        info!(
            user_id = %event.user_id,
            lines = event.lines.len(),
            "Order confirmation applied"
        );
    }

    async fn confirm_line(
        &self,
        user_id: UserId,
        line: &TicketRequest,
    ) -> Result<(), ReservationError> {
        self.coordinator.finalize_reservation(user_id, line).await?;
        let confirmed = self
            .repository
            .confirm_reservation(user_id, line.ticket_id)
            .await
            .map_err(ReservationError::from)?;
        if !confirmed {
            debug!(
                ticket_id = %line.ticket_id,
                user_id = %user_id,
                "No temporary reservation to confirm; redelivered event"
            );
        }
        Ok(())
    }
}

/// Handles `OrderCancelled`: release every line's holds and cancel the
/// shadow rows.
#[derive(Clone)]
pub struct CancelHandler<L: LeaseStore, R: ReservationRepository> {
    coordinator: ReservationCoordinator<L>,
    repository: R,
}

impl<L: LeaseStore, R: ReservationRepository> CancelHandler<L, R> {
    /// Creates a cancel handler.
    pub const fn new(coordinator: ReservationCoordinator<L>, repository: R) -> Self {
        Self {
            coordinator,
            repository,
        }
    }

    /// Apply one order cancellation. Each line is its own unit of work: a
    /// failing line is logged and skipped so the lines after it are still
    /// released.
    pub async fn process(&self, event: &OrderCancelled) {
        for line in &event.lines {
            if let Err(e) = self.cancel_line(event.user_id, line).await {
                error!(
                    ticket_id = %line.ticket_id,
                    user_id = %event.user_id,
                    error = %e,
                    "Failed to cancel order line; continuing with the rest"
                );
            }
        }
        info!(
            user_id = %event.user_id,
            lines = event.lines.len(),
            "Order cancellation applied"
        );
    }

    async fn cancel_line(
        &self,
        user_id: UserId,
        line: &TicketRequest,
    ) -> Result<(), ReservationError> {
        self.coordinator.release_reservation(user_id, line).await?;
        let released = self
            .repository
            .release_reservation(user_id, line.ticket_id, ReleaseMode::Explicit)
            .await
            .map_err(ReservationError::from)?;
        if !released {
            debug!(
                ticket_id = %line.ticket_id,
                user_id = %user_id,
                "No temporary reservation to cancel; redelivered event"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<L: LeaseStore, R: ReservationRepository> MessageHandler for ReserveHandler<L, R> {
    async fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let command: ReserveTicketsCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Undecodable reserve command; dropping");
                return None;
            }
        };
        let reply = self.process(&command).await;
        match serde_json::to_vec(&reply) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(error = %e, "Failed to encode reserve reply");
                None
            }
        }
    }
}

#[async_trait]
impl<L: LeaseStore, R: ReservationRepository> MessageHandler for ConfirmHandler<L, R> {
    async fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let event: OrderConfirmed = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable order confirmation; dropping");
                return None;
            }
        };
        self.process(&event).await;
        None
    }
}

#[async_trait]
impl<L: LeaseStore, R: ReservationRepository> MessageHandler for CancelHandler<L, R> {
    async fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let event: OrderCancelled = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable order cancellation; dropping");
                return None;
            }
        };
        self.process(&event).await;
        None
    }
}

/// Ticket requests as they appear in order lines.
pub type OrderLine = TicketRequest;

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lease::{keys, InMemoryLeaseStore, LeaseStore};
    use crate::store::InMemoryReservationRepository;
    use crate::types::{ReservationStatus, Seat, TicketId, UserId};
    use std::time::Duration;

    fn fixtures() -> (
        ReservationCoordinator<InMemoryLeaseStore>,
        InMemoryReservationRepository,
    ) {
        let lease = InMemoryLeaseStore::new();
        let coordinator = ReservationCoordinator::new(
            lease,
            Duration::from_secs(900),
            Duration::from_secs(3),
            Duration::from_millis(100),
        );
        (coordinator, InMemoryReservationRepository::new())
    }

    #[tokio::test]
    async fn sold_out_reserve_replies_with_inventory_issue() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        coordinator.seed_counter(ticket_id, 1).await.expect("seed");
        repo.create_ticket(ticket_id, 1);
        let handler = ReserveHandler::new(coordinator, repo);

        let first = handler
            .process(&ReserveTicketsCommand {
                user_id: UserId::new(),
                ticket: TicketRequest::quantity(ticket_id, 1),
            })
            .await;
        assert!(first.success);

        let second = handler
            .process(&ReserveTicketsCommand {
                user_id: UserId::new(),
                ticket: TicketRequest::quantity(ticket_id, 1),
            })
            .await;
        assert!(!second.success);
        assert!(matches!(
            second.failure,
            Some(FailureKind::InventoryIssue { .. })
        ));
    }

    #[tokio::test]
    async fn redelivered_reserve_command_debits_once() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        coordinator.seed_counter(ticket_id, 5).await.expect("seed");
        repo.create_ticket(ticket_id, 5);
        let handler = ReserveHandler::new(coordinator.clone(), repo.clone());

        let command = ReserveTicketsCommand {
            user_id,
            ticket: TicketRequest::quantity(ticket_id, 2),
        };
        assert!(handler.process(&command).await.success);
        assert!(handler.process(&command).await.success);

        assert_eq!(
            coordinator.remaining(ticket_id).await.expect("remaining"),
            Some(3)
        );
        assert_eq!(repo.remaining_count(ticket_id), Some(3));
        assert_eq!(
            repo.statuses(user_id, ticket_id),
            vec![ReservationStatus::Temporary]
        );
    }

    #[tokio::test]
    async fn redelivered_seat_reserve_command_debits_once() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        coordinator.seed_counter(ticket_id, 10).await.expect("seed");
        repo.create_ticket(ticket_id, 10);
        let handler = ReserveHandler::new(coordinator, repo.clone());

        let command = ReserveTicketsCommand {
            user_id,
            ticket: TicketRequest::seats(ticket_id, vec![Seat::new("A", 1), Seat::new("A", 2)]),
        };
        assert!(handler.process(&command).await.success);
        assert!(handler.process(&command).await.success);

        // One debit, one shadow row: the second delivery was a no-op.
        assert_eq!(repo.remaining_count(ticket_id), Some(8));
        assert_eq!(
            repo.statuses(user_id, ticket_id),
            vec![ReservationStatus::Temporary]
        );
    }

    #[tokio::test]
    async fn durable_failure_rolls_the_hold_back() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        coordinator.seed_counter(ticket_id, 5).await.expect("seed");
        // No durable ticket row: the shadow write must fail.
        let handler = ReserveHandler::new(coordinator.clone(), repo);

        let reply = handler
            .process(&ReserveTicketsCommand {
                user_id: UserId::new(),
                ticket: TicketRequest::quantity(ticket_id, 2),
            })
            .await;
        assert!(!reply.success);
        // The compensating release restored the cache counter.
        assert_eq!(
            coordinator.remaining(ticket_id).await.expect("remaining"),
            Some(5)
        );
    }

    #[tokio::test]
    async fn cancel_restores_cache_and_shadow() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        coordinator.seed_counter(ticket_id, 5).await.expect("seed");
        repo.create_ticket(ticket_id, 5);
        let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
        let cancel = CancelHandler::new(coordinator.clone(), repo.clone());

        let line = TicketRequest::quantity(ticket_id, 3);
        assert!(
            reserve
                .process(&ReserveTicketsCommand {
                    user_id,
                    ticket: line.clone(),
                })
                .await
                .success
        );

        cancel
            .process(&OrderCancelled {
                user_id,
                lines: vec![line],
            })
            .await;

        assert_eq!(
            coordinator.remaining(ticket_id).await.expect("remaining"),
            Some(5)
        );
        assert_eq!(repo.remaining_count(ticket_id), Some(5));
        assert_eq!(
            repo.statuses(user_id, ticket_id),
            vec![ReservationStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn confirm_skips_a_failing_line_and_continues() {
        let lease = InMemoryLeaseStore::new();
        let coordinator = ReservationCoordinator::new(
            lease.clone(),
            Duration::from_secs(900),
            Duration::from_secs(3),
            Duration::from_millis(100),
        );
        let repo = InMemoryReservationRepository::new();
        let user_id = UserId::new();
        let bad_ticket = TicketId::new();
        let good_ticket = TicketId::new();
        coordinator.seed_counter(good_ticket, 5).await.expect("seed");
        repo.create_ticket(good_ticket, 5);

        let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
        let good_line = TicketRequest::quantity(good_ticket, 2);
        assert!(
            reserve
                .process(&ReserveTicketsCommand {
                    user_id,
                    ticket: good_line.clone(),
                })
                .await
                .success
        );

        // An undecodable seat hold makes the first line fail outright.
        let bad_seat = Seat::new("A", 1);
        lease
            .put_json(&keys::seat_hold(bad_ticket, &bad_seat), &"garbage", None)
            .await
            .expect("put");
        let bad_line = TicketRequest::seats(bad_ticket, vec![bad_seat]);

        let confirm = ConfirmHandler::new(coordinator, repo.clone());
        confirm
            .process(&OrderConfirmed {
                user_id,
                lines: vec![bad_line, good_line],
            })
            .await;

        // The line after the failure was still confirmed.
        assert_eq!(
            repo.statuses(user_id, good_ticket),
            vec![ReservationStatus::Confirmed]
        );
    }

    #[tokio::test]
    async fn confirm_is_safe_under_redelivery() {
        let (coordinator, repo) = fixtures();
        let ticket_id = TicketId::new();
        let user_id = UserId::new();
        coordinator.seed_counter(ticket_id, 5).await.expect("seed");
        repo.create_ticket(ticket_id, 5);
        let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
        let confirm = ConfirmHandler::new(coordinator, repo.clone());

        let line = TicketRequest::quantity(ticket_id, 2);
        assert!(
            reserve
                .process(&ReserveTicketsCommand {
                    user_id,
                    ticket: line.clone(),
                })
                .await
                .success
        );

        let event = OrderConfirmed {
            user_id,
            lines: vec![line],
        };
        confirm.process(&event).await;
        confirm.process(&event).await;

        assert_eq!(repo.remaining_count(ticket_id), Some(3));
        assert_eq!(
            repo.statuses(user_id, ticket_id),
            vec![ReservationStatus::Confirmed]
        );
    }
}
