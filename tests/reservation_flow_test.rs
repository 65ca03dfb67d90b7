//! End-to-end reservation flows over the in-memory stores.
//!
//! Exercises the full unit of work the workflow handlers run: cache hold,
//! durable shadow, replies, and the release paths.

#![allow(clippy::expect_used)]

use boxoffice::consumers::{
    CancelHandler, FailureKind, OrderCancelled, ReserveHandler, ReserveTicketsCommand,
};
use boxoffice::coordinator::ReservationCoordinator;
use boxoffice::error::ReservationError;
use boxoffice::lease::InMemoryLeaseStore;
use boxoffice::store::InMemoryReservationRepository;
use boxoffice::types::{Seat, TicketId, TicketRequest, UserId};
use std::time::Duration;

fn coordinator(lease: InMemoryLeaseStore) -> ReservationCoordinator<InMemoryLeaseStore> {
    ReservationCoordinator::new(
        lease,
        Duration::from_secs(900),
        Duration::from_secs(3),
        Duration::from_millis(200),
    )
}

async fn setup(
    total: u32,
) -> (
    ReservationCoordinator<InMemoryLeaseStore>,
    InMemoryReservationRepository,
    TicketId,
) {
    let coordinator = coordinator(InMemoryLeaseStore::new());
    let repo = InMemoryReservationRepository::new();
    let ticket_id = TicketId::new();
    coordinator.seed_counter(ticket_id, total).await.expect("seed");
    repo.create_ticket(ticket_id, total);
    (coordinator, repo, ticket_id)
}

fn reserve_command(user_id: UserId, ticket: TicketRequest) -> ReserveTicketsCommand {
    ReserveTicketsCommand { user_id, ticket }
}

#[tokio::test]
async fn capacity_is_enforced_until_a_release_frees_it() {
    let (coordinator, repo, ticket_id) = setup(5).await;
    let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
    let cancel = CancelHandler::new(coordinator.clone(), repo.clone());

    let mut buyers = Vec::new();
    for _ in 0..5 {
        let user_id = UserId::new();
        let reply = reserve
            .process(&reserve_command(
                user_id,
                TicketRequest::quantity(ticket_id, 1),
            ))
            .await;
        assert!(reply.success);
        buyers.push(user_id);
    }

    // Sixth buyer finds the ticket sold out.
    let reply = reserve
        .process(&reserve_command(
            UserId::new(),
            TicketRequest::quantity(ticket_id, 1),
        ))
        .await;
    assert!(!reply.success);
    assert!(matches!(
        reply.failure,
        Some(FailureKind::InventoryIssue { .. })
    ));

    // One buyer backs out; exactly one more unit becomes available.
    cancel
        .process(&OrderCancelled {
            user_id: buyers[0],
            lines: vec![TicketRequest::quantity(ticket_id, 1)],
        })
        .await;

    let reply = reserve
        .process(&reserve_command(
            UserId::new(),
            TicketRequest::quantity(ticket_id, 1),
        ))
        .await;
    assert!(reply.success);
    assert_eq!(
        coordinator.remaining(ticket_id).await.expect("remaining"),
        Some(0)
    );
    assert_eq!(repo.remaining_count(ticket_id), Some(0));
}

#[tokio::test]
async fn contested_seat_frees_up_after_cancellation() {
    let (coordinator, repo, ticket_id) = setup(10).await;
    let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
    let cancel = CancelHandler::new(coordinator, repo);

    let first = UserId::new();
    let second = UserId::new();
    let contested = TicketRequest::seats(ticket_id, vec![Seat::new("A", 2)]);

    let reply = reserve
        .process(&reserve_command(first, contested.clone()))
        .await;
    assert!(reply.success);

    let reply = reserve
        .process(&reserve_command(second, contested.clone()))
        .await;
    assert!(!reply.success);
    match reply.failure {
        Some(FailureKind::SeatConflict { seat, .. }) => assert_eq!(seat, Seat::new("A", 2)),
        other => panic!("expected seat conflict, got {other:?}"),
    }

    cancel
        .process(&OrderCancelled {
            user_id: first,
            lines: vec![contested.clone()],
        })
        .await;

    let reply = reserve.process(&reserve_command(second, contested)).await;
    assert!(reply.success);
}

#[tokio::test]
async fn concurrent_buyers_never_oversell_the_counter() {
    let lease = InMemoryLeaseStore::new();
    let coordinator = coordinator(lease);
    let ticket_id = TicketId::new();
    coordinator.seed_counter(ticket_id, 8).await.expect("seed");

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..20 {
        let coordinator = coordinator.clone();
        tasks.spawn(async move {
            coordinator
                .reserve_tickets(UserId::new(), &TicketRequest::quantity(ticket_id, 1))
                .await
        });
    }

    let mut successes = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.expect("task") {
            Ok(()) => successes += 1,
            Err(ReservationError::InventoryIssue { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 8);
    assert_eq!(
        coordinator.remaining(ticket_id).await.expect("remaining"),
        Some(0)
    );
}

#[tokio::test]
async fn concurrent_seat_race_has_exactly_one_winner() {
    let lease = InMemoryLeaseStore::new();
    let coordinator = coordinator(lease);
    let ticket_id = TicketId::new();
    let seat = Seat::new("B", 7);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let coordinator = coordinator.clone();
        let request = TicketRequest::seats(ticket_id, vec![seat.clone()]);
        tasks.spawn(async move { coordinator.reserve_tickets(UserId::new(), &request).await });
    }

    let mut winners = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.expect("task") {
            Ok(()) => winners += 1,
            Err(ReservationError::SeatConflict { .. } | ReservationError::LockTimeout { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn round_trip_reserve_cancel_reserve_preserves_inventory() {
    let (coordinator, repo, ticket_id) = setup(4).await;
    let reserve = ReserveHandler::new(coordinator.clone(), repo.clone());
    let cancel = CancelHandler::new(coordinator.clone(), repo.clone());
    let user_id = UserId::new();
    let line = TicketRequest::quantity(ticket_id, 4);

    for _ in 0..3 {
        let reply = reserve.process(&reserve_command(user_id, line.clone())).await;
        assert!(reply.success);
        cancel
            .process(&OrderCancelled {
                user_id,
                lines: vec![line.clone()],
            })
            .await;
    }

    assert_eq!(
        coordinator.remaining(ticket_id).await.expect("remaining"),
        Some(4)
    );
    assert_eq!(repo.remaining_count(ticket_id), Some(4));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// However the reserve attempts interleave with capacity, the
        /// counter always equals total minus the successfully held units
        /// and never goes negative.
        #[test]
        fn counter_accounts_for_every_successful_hold(
            total in 1u32..50,
            quantities in proptest::collection::vec(1u32..8, 1..12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let coordinator = coordinator(InMemoryLeaseStore::new());
                let ticket_id = TicketId::new();
                coordinator.seed_counter(ticket_id, total).await.expect("seed");

                let mut held: i64 = 0;
                for quantity in quantities {
                    let outcome = coordinator
                        .reserve_tickets(
                            UserId::new(),
                            &TicketRequest::quantity(ticket_id, quantity),
                        )
                        .await;
                    if outcome.is_ok() {
                        held += i64::from(quantity);
                    }
                }

                let remaining = coordinator
                    .remaining(ticket_id)
                    .await
                    .expect("remaining")
                    .expect("seeded");
                assert!(remaining >= 0);
                assert_eq!(remaining, i64::from(total) - held);
            });
        }
    }
}
