//! Expiry Reconciler: the background sweep that closes the gap between
//! the cache and the durable shadow.
//!
//! Runs on a fixed interval, independent of request handling. Holds whose
//! lease window has lapsed (judged from `reserved_at`, never from the
//! record's physical TTL) are reclaimed through the lease store's
//! conditional transaction — a hold released normally between the scan and
//! the action is a safe no-op — and the durable shadow is released in
//! clean-up mode so the relational state converges. One bad record never
//! stops the sweep.

use crate::error::ReservationError;
use crate::lease::{keys, LeaseStore};
use crate::store::{ReleaseMode, ReservationRepository};
use crate::types::{QuantityHold, SeatHold};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Background sweep over the quantity-hold and seat-hold namespaces.
#[derive(Clone)]
pub struct ExpiryReconciler<L: LeaseStore, R: ReservationRepository> {
    lease: L,
    repository: R,
    /// The authoritative hold lease window
    hold_ttl: Duration,
    /// Delay between sweeps
    interval: Duration,
}

impl<L: LeaseStore, R: ReservationRepository> ExpiryReconciler<L, R> {
    /// Creates a reconciler. `hold_ttl` must match the coordinator's lease
    /// window; `interval` is the fixed delay between sweeps.
    pub const fn new(lease: L, repository: R, hold_ttl: Duration, interval: Duration) -> Self {
        Self {
            lease,
            repository,
            hold_ttl,
            interval,
        }
    }

    /// Spawn the sweep loop as a background task. The task exits when the
    /// shutdown signal fires.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            hold_ttl_secs = self.hold_ttl.as_secs(),
            "Expiry reconciler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Expiry reconciler received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
        info!("Expiry reconciler stopped");
    }

    /// One full pass over both hold namespaces. Public so tests can drive
    /// sweeps deterministically without the timer loop.
    pub async fn sweep(&self) {
        self.sweep_quantity_holds().await;
        self.sweep_seat_holds().await;
    }

    async fn sweep_quantity_holds(&self) {
        let keys = match self.lease.scan_keys(keys::QUANTITY_HOLD_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan quantity holds; skipping sweep");
                return;
            }
        };
        for key in keys {
            if let Err(e) = self.reconcile_quantity_hold(&key).await {
                warn!(key = %key, error = %e, "Failed to reconcile quantity hold; continuing sweep");
            }
        }
    }

    async fn sweep_seat_holds(&self) {
        let keys = match self.lease.scan_keys(keys::SEAT_HOLD_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan seat holds; skipping sweep");
                return;
            }
        };
        for key in keys {
            if let Err(e) = self.reconcile_seat_hold(&key).await {
                warn!(key = %key, error = %e, "Failed to reconcile seat hold; continuing sweep");
            }
        }
    }

    async fn reconcile_quantity_hold(&self, key: &str) -> Result<(), ReservationError> {
        let Some((ticket_id, user_id)) = keys::parse_quantity_hold(key) else {
            debug!(key = %key, "Key outside the quantity-hold namespace; skipping");
            return Ok(());
        };
        let Some(raw) = self.lease.get_raw(key).await? else {
            return Ok(());
        };
        let Ok(hold) = serde_json::from_str::<QuantityHold>(&raw) else {
            warn!(key = %key, "Undecodable quantity hold; skipping");
            return Ok(());
        };
        if !hold.lease_lapsed(self.hold_ttl) {
            return Ok(());
        }

        let counter = keys::remaining_counter(ticket_id);
        let reclaimed = self
            .lease
            .reclaim_hold(key, &raw, &counter, i64::from(hold.quantity))
            .await?;
        if !reclaimed {
            // Released or replaced between scan and action.
            return Ok(());
        }
        info!(
            ticket_id = %ticket_id,
            user_id = %user_id,
            quantity = hold.quantity,
            "Reclaimed lapsed quantity hold"
        );
        self.repository
            .release_reservation(user_id, ticket_id, ReleaseMode::CleanUp)
            .await?;
        Ok(())
    }

    async fn reconcile_seat_hold(&self, key: &str) -> Result<(), ReservationError> {
        let Some(ticket_id) = keys::parse_seat_hold_ticket(key) else {
            debug!(key = %key, "Key outside the seat-hold namespace; skipping");
            return Ok(());
        };
        let Some(raw) = self.lease.get_raw(key).await? else {
            return Ok(());
        };
        let Ok(hold) = serde_json::from_str::<SeatHold>(&raw) else {
            warn!(key = %key, "Undecodable seat hold; skipping");
            return Ok(());
        };
        if !hold.lease_lapsed(self.hold_ttl) {
            return Ok(());
        }

        // Seat holds never touch the counter; the durable release restores
        // the shadow's quantity.
        let counter = keys::remaining_counter(ticket_id);
        let reclaimed = self.lease.reclaim_hold(key, &raw, &counter, 0).await?;
        if !reclaimed {
            return Ok(());
        }
        info!(
            ticket_id = %ticket_id,
            user_id = %hold.user_id,
            key = %key,
            "Reclaimed lapsed seat hold"
        );
        self.repository
            .release_reservation(hold.user_id, ticket_id, ReleaseMode::CleanUp)
            .await?;
        Ok(())
    }
}
