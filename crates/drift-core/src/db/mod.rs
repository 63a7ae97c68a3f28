//! Durable storage layer for the sync engine

mod connection;
mod conflict_repository;
mod migrations;
mod queue_repository;
mod version_repository;

pub use connection::Database;
pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use queue_repository::{QueueRepository, SqliteQueueRepository};
pub use version_repository::{SqliteVersionRepository, VersionRepository};
