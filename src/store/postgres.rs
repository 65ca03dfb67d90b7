//! Postgres-backed reservation repository.
//!
//! All counter mutation happens under `SELECT ... FOR UPDATE` inside a
//! transaction; a failing step rolls back the whole operation when the
//! transaction drops uncommitted.

use crate::error::StoreError;
use crate::store::{ReleaseMode, ReservationRepository};
use crate::types::{ReservationId, ReservationStatus, TicketId, TicketRequest, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Postgres implementation of [`ReservationRepository`].
#[derive(Clone)]
pub struct PgReservationStore {
    pool: Arc<PgPool>,
}

impl PgReservationStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub const fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Insert a ticket row with its full quantity; used when a ticket
    /// goes on sale (and by tests).
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn create_ticket(&self, ticket_id: TicketId, total: u32) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tickets (id, remaining_count) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET remaining_count = EXCLUDED.remaining_count",
        )
        .bind(ticket_id.as_uuid())
        .bind(int_quantity(total))
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// The ticket's durable remaining count, `None` when the row is absent.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn remaining_count(&self, ticket_id: TicketId) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query("SELECT remaining_count FROM tickets WHERE id = $1")
            .bind(ticket_id.as_uuid())
            .fetch_optional(self.pool.as_ref())
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("remaining_count")?)),
            None => Ok(None),
        }
    }

    /// Restore `quantity` to a row-locked ticket counter.
    async fn restore_quantity(
        tx: &mut Transaction<'_, Postgres>,
        ticket_id: &Uuid,
        quantity: i32,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT remaining_count FROM tickets WHERE id = $1 FOR UPDATE")
            .bind(ticket_id)
            .fetch_optional(&mut **tx)
            .await?;
        sqlx::query("UPDATE tickets SET remaining_count = remaining_count + $2 WHERE id = $1")
            .bind(ticket_id)
            .bind(quantity)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Quantities and seat numbers fit comfortably in an INTEGER column.
#[allow(clippy::cast_possible_wrap)]
const fn int_quantity(value: u32) -> i32 {
    value as i32
}

#[async_trait]
impl ReservationRepository for PgReservationStore {
    async fn persist_reservation(
        &self,
        user_id: UserId,
        request: &TicketRequest,
        expires_at: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError> {
        let mut tx = self.pool.begin().await?;

        // (a) Defensive self-cleanup: the caller's own temporary
        // reservation for this ticket whose lease already lapsed.
        let stale = sqlx::query(
            "SELECT r.id AS reservation_id, i.id AS item_id, i.quantity
             FROM reservations r
             JOIN reservation_items i ON i.reservation_id = r.id
             WHERE r.user_id = $1 AND i.ticket_id = $2
               AND r.status = 'temporary' AND r.expires_at <= now()",
        )
        .bind(user_id.as_uuid())
        .bind(request.ticket_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        for row in stale {
            let reservation_id: Uuid = row.try_get("reservation_id")?;
            let item_id: Uuid = row.try_get("item_id")?;
            let quantity: i32 = row.try_get("quantity")?;

            Self::restore_quantity(&mut tx, request.ticket_id.as_uuid(), quantity).await?;
            sqlx::query("DELETE FROM seat_assignments WHERE item_id = $1")
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM reservation_items WHERE id = $1")
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM reservations WHERE id = $1")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await?;
            debug!(
                reservation_id = %reservation_id,
                user_id = %user_id,
                "Cleaned up caller's stale temporary reservation"
            );
        }

        // (b) Row-lock the ticket and debit the durable counter.
        let ticket_row = sqlx::query("SELECT remaining_count FROM tickets WHERE id = $1 FOR UPDATE")
            .bind(request.ticket_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(ticket_row) = ticket_row else {
            return Err(StoreError::TicketMissing(request.ticket_id));
        };
        let remaining: i32 = ticket_row.try_get("remaining_count")?;
        if i64::from(remaining) < i64::from(request.quantity) {
            // Dropping the uncommitted transaction rolls back (a) too.
            return Err(StoreError::InsufficientInventory {
                ticket_id: request.ticket_id,
                remaining: i64::from(remaining),
                requested: i64::from(request.quantity),
            });
        }
        sqlx::query("UPDATE tickets SET remaining_count = remaining_count - $2 WHERE id = $1")
            .bind(request.ticket_id.as_uuid())
            .bind(int_quantity(request.quantity))
            .execute(&mut *tx)
            .await?;

        // (c) The new reservation, its item, and any seat assignments.
        let reservation_id = ReservationId::new();
        let item_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, created_at, expires_at, status)
             VALUES ($1, $2, now(), $3, $4)",
        )
        .bind(reservation_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(expires_at)
        .bind(ReservationStatus::Temporary.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO reservation_items (id, reservation_id, ticket_id, quantity, has_assigned_seats)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(item_id)
        .bind(reservation_id.as_uuid())
        .bind(request.ticket_id.as_uuid())
        .bind(int_quantity(request.quantity))
        .bind(request.has_assigned_seats())
        .execute(&mut *tx)
        .await?;
        for seat in &request.seats_chosen {
            sqlx::query(
                "INSERT INTO seat_assignments (id, item_id, row_name, seat_number)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(item_id)
            .bind(&seat.row_name)
            .bind(int_quantity(seat.seat_number))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            reservation_id = %reservation_id,
            ticket_id = %request.ticket_id,
            user_id = %user_id,
            quantity = request.quantity,
            "Persisted reservation shadow"
        );
        Ok(reservation_id)
    }

    async fn release_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
        mode: ReleaseMode,
    ) -> Result<bool, StoreError> {
        let (expiry_filter, new_status) = match mode {
            ReleaseMode::CleanUp => ("r.expires_at <= now()", ReservationStatus::Expired),
            ReleaseMode::Explicit => ("r.expires_at > now()", ReservationStatus::Cancelled),
        };

        let mut tx = self.pool.begin().await?;
        let matches = sqlx::query(&format!(
            "SELECT r.id AS reservation_id, i.quantity
             FROM reservations r
             JOIN reservation_items i ON i.reservation_id = r.id
             WHERE r.user_id = $1 AND i.ticket_id = $2
               AND r.status = 'temporary' AND {expiry_filter}"
        ))
        .bind(user_id.as_uuid())
        .bind(ticket_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        if matches.is_empty() {
            return Ok(false);
        }

        for row in &matches {
            let reservation_id: Uuid = row.try_get("reservation_id")?;
            let quantity: i32 = row.try_get("quantity")?;

            Self::restore_quantity(&mut tx, ticket_id.as_uuid(), quantity).await?;
            sqlx::query("UPDATE reservations SET status = $2 WHERE id = $1")
                .bind(reservation_id)
                .bind(new_status.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            ticket_id = %ticket_id,
            user_id = %user_id,
            released = matches.len(),
            status = %new_status,
            "Released durable reservations"
        );
        Ok(true)
    }

    async fn confirm_reservation(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reservations r SET status = 'confirmed'
             FROM reservation_items i
             WHERE i.reservation_id = r.id
               AND r.user_id = $1 AND i.ticket_id = $2 AND r.status = 'temporary'",
        )
        .bind(user_id.as_uuid())
        .bind(ticket_id.as_uuid())
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_ticket_reserved(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM reservations r
                 JOIN reservation_items i ON i.reservation_id = r.id
                 WHERE r.user_id = $1 AND i.ticket_id = $2
                   AND r.status = 'temporary' AND r.expires_at > now()
             ) AS reserved",
        )
        .bind(user_id.as_uuid())
        .bind(ticket_id.as_uuid())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(row.try_get("reserved")?)
    }
}
