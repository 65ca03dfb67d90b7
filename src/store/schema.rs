//! Relational schema for the durable shadow.

use sqlx::PgPool;

const TABLES: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS tickets (
        id UUID PRIMARY KEY,
        remaining_count INTEGER NOT NULL CHECK (remaining_count >= 0)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS reservations (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS reservation_items (
        id UUID PRIMARY KEY,
        reservation_id UUID NOT NULL REFERENCES reservations(id),
        ticket_id UUID NOT NULL REFERENCES tickets(id),
        quantity INTEGER NOT NULL,
        has_assigned_seats BOOLEAN NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS seat_assignments (
        id UUID PRIMARY KEY,
        item_id UUID NOT NULL REFERENCES reservation_items(id),
        row_name TEXT NOT NULL,
        seat_number INTEGER NOT NULL,
        UNIQUE (item_id, row_name, seat_number)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_items_reservation ON reservation_items(reservation_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_ticket ON reservation_items(ticket_id)",
];

/// Create the reservation tables if they do not exist.
///
/// # Errors
///
/// Returns the underlying database error if any statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in TABLES {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
