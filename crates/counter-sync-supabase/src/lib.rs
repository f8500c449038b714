//! Supabase backend for counter-sync.
//!
//! - `GoTrueClient`: anonymous/password sign-in, refresh, sign-out
//! - `PostgrestClient`: row upsert/update/delete through the REST API
//! - `SupabaseConnector`: the upload bridge and session lifecycle
//! - `UploadScheduler`: drains the local queue with retry and backoff

pub mod auth;
pub mod config;
pub mod connector;
pub mod postgrest;
pub mod scheduler;

pub use auth::GoTrueClient;
pub use config::{Command, Config};
pub use connector::SupabaseConnector;
pub use postgrest::PostgrestClient;
pub use scheduler::{RetryPolicy, UploadScheduler, UploadStatus};
