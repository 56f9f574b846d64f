//! Key-value stores with per-entry expiry.
//!
//! `InMemoryKvStore` is process-local and suits a single instance or tests;
//! `SqliteKvStore` survives restarts so sessions outlive the manager process.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryKvStore;
pub use sqlite::SqliteKvStore;
