//! Lease store: the shared, TTL-capable key/value layer.
//!
//! [`LeaseStore`] is the contract (atomic counters, TTL records,
//! conditional reclaim); [`RedisLeaseStore`] is the production
//! implementation and [`InMemoryLeaseStore`] the test double.

pub mod keys;
mod memory;
mod store;

pub use memory::InMemoryLeaseStore;
pub use store::{LeaseStore, RedisLeaseStore};
