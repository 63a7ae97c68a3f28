//! drift-core - Core library for Drift
//!
//! This crate contains the sync engine shared by all Drift interfaces: the
//! durable operation queue, the remote sync client, and the coordinator that
//! reconciles local documents with the server.

pub mod client;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod sync;

pub use error::{Error, Result};
pub use models::{DocumentSnapshot, SyncDocument};
