//! Local SQLite database for counter-sync.
//!
//! Local writes go through [`LocalDatabase::write`], which applies the row
//! changes and appends the matching crud entries in a single SQLite
//! transaction. The crud log is exposed to the upload bridge as a
//! [`counter_sync_core::MutationQueue`].

pub mod counters;
pub mod database;
pub mod error;

pub use counters::{Counter, COUNTER_TABLE};
pub use database::{LocalDatabase, WriteBatch};
pub use error::LocalError;
