//! Core traits and types for the counter-sync upload bridge.
//!
//! This crate defines the abstractions shared between the local database and
//! the backend implementations:
//! - `MutationQueue`: ordered, durable log of locally committed transactions
//! - `RemoteStore`: row-level upsert/update/delete against remote tables
//! - `AuthProvider`: session acquisition and refresh
//! - `BackendConnector`: the role the sync engine talks to (credentials + upload)
//! - `Observer`: synchronous listener registry for connector events

mod auth;
mod connector;
mod error;
mod mutation;
mod observer;
mod remote;

pub use auth::{AuthProvider, Credentials, Session, User};
pub use connector::{BackendConnector, ConnectorEvent};
pub use error::{AuthError, ErrorClass, RemoteError, Result, SyncError};
pub use mutation::{MemoryMutationQueue, MutationOp, MutationQueue, MutationTransaction, OpKind};
pub use observer::{ListenerId, Observer};
pub use remote::RemoteStore;
