use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::scheduler::RetryPolicy;

/// Configuration for the counter-sync client.
#[derive(Parser, Debug, Clone)]
#[command(name = "counter-sync")]
#[command(about = "Offline-first counter that uploads local changes to Supabase")]
pub struct Config {
    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: String,

    /// Supabase anon (public) API key
    #[arg(long, env = "SUPABASE_ANON_KEY")]
    pub supabase_anon_key: String,

    /// PowerSync instance URL handed out with credentials
    #[arg(long, env = "POWERSYNC_URL")]
    pub powersync_url: String,

    /// Local SQLite database (default: example.db in the user data dir)
    #[arg(long, env = "COUNTER_SYNC_DB")]
    pub database: Option<PathBuf>,

    /// Auth session file kept between runs (default: session.json in the user data dir)
    #[arg(long, env = "COUNTER_SYNC_SESSION")]
    pub session_file: Option<PathBuf>,

    /// HTTP request timeout (seconds)
    #[arg(long, default_value = "30", env = "HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,

    /// Retries for a failing upload before giving up
    #[arg(long, default_value = "5", env = "UPLOAD_MAX_RETRIES")]
    pub upload_max_retries: u32,

    /// First retry delay (milliseconds); doubles on each retry
    #[arg(long, default_value = "200", env = "UPLOAD_BASE_DELAY_MS")]
    pub upload_base_delay_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a counter for the signed-in user
    Create,
    /// Add one to the signed-in user's counter
    Increment,
    /// Delete the signed-in user's counter
    Delete,
    /// List all local counters
    List,
    /// Upload pending local changes
    Upload,
    /// Show session and upload queue state
    Status,
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "COUNTER_SYNC_PASSWORD")]
        password: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Upload continuously as local changes arrive
    Watch,
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| data_dir().join("example.db"))
    }

    /// Without a stored session every run would sign up a new anonymous user.
    pub fn session_path(&self) -> PathBuf {
        self.session_file
            .clone()
            .unwrap_or_else(|| data_dir().join("session.json"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upload_max_retries,
            base_delay: Duration::from_millis(self.upload_base_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("counter-sync")
}
