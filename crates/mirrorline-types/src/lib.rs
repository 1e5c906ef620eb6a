//! Shared mirrorline error taxonomy and data model types.
//!
//! This crate has no I/O so both the storage backends and the engine can
//! depend on it without cycles.

pub mod cms;
pub mod error;
pub mod item;
pub mod state;

pub use error::{ErrorKind, SyncError};
