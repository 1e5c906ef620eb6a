//! Entity persistence and sync-run ledger for mirrorline.
//!
//! Provides the [`StorageBackend`] trait with a network relational
//! ([`PostgresBackend`]) and an embedded ([`SqliteBackend`]) implementation.
//! Every write is an idempotent upsert keyed by natural identity.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod postgres;
pub mod sqlite;

pub use backend::{BackendKind, StorageBackend};
pub use error::StateError;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
