//! Persistence layer for the compute-once gate.
//!
//! Provides a SQLite-backed lease store so that several workers sharing one
//! database file never compute the same cache key twice.

pub mod db;
pub mod leases;

pub use db::{init_database, Database};
pub use leases::SqliteLeaseStore;
