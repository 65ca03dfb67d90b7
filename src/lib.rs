//! Ticket reservation and inventory-consistency service.
//!
//! Inventory truth for live sales sits in a Redis lease store: an atomic
//! remaining-quantity counter per ticket plus time-boxed hold records for
//! quantities and individual seats. Postgres carries a durable shadow of
//! every hold for crash recovery and audit. Workflow consumers drive the
//! reserve/confirm/cancel paths over Kafka command topics, and a background
//! reconciler sweeps lapsed holds back into inventory.
//!
//! # Architecture
//!
//! - [`lease`] — the cache layer: counters, holds, conditional transactions
//! - [`lock`] — per-seat mutual-exclusion leases for seat-based requests
//! - [`coordinator`] — hold placement, validation, release, finalization
//! - [`store`] — the durable reservation shadow in Postgres
//! - [`reconciler`] — the expiry sweep restoring lapsed holds
//! - [`consumers`] — Kafka command topics and their handlers

pub mod config;
pub mod consumers;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod lock;
pub mod reconciler;
pub mod store;
pub mod types;

pub use config::Config;
pub use coordinator::ReservationCoordinator;
pub use error::{LeaseError, ReservationError, StoreError};
pub use reconciler::ExpiryReconciler;
