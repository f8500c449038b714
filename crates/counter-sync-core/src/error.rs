//! Error taxonomy for the upload bridge and its collaborators.

use std::fmt;

/// Errors surfaced to callers of the connector and the upload scheduler.
///
/// Fatal remote errors never show up here: the bridge absorbs them by
/// discarding the owning transaction.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Could not fetch credentials: {0}")]
    NoSession(String),

    #[error("Could not update Supabase. Received error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Local queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the failure is worth retrying after a delay.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(err) => err.class() == ErrorClass::Transient,
            Self::NoSession(_) | Self::Auth(_) => true,
            Self::Queue(_) | Self::Serialization(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures reported by the auth service client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Auth request failed: {0}")]
    Http(String),

    #[error("Auth service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid auth response: {0}")]
    Decode(String),

    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Outcome class of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help; the owning transaction is discarded.
    Fatal,
    /// Network or server hiccup; the transaction stays queued.
    Transient,
}

/// A failed remote store call.
///
/// `code` is the provider code (a Postgres SQLSTATE or a PostgREST `PGRST*`
/// code). Transport failures carry no code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<String>,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, Copy)]
enum CodePattern {
    /// Any five-character SQLSTATE in the given two-character class.
    SqlStateClass(&'static str),
    Exact(&'static str),
}

impl CodePattern {
    fn matches(self, code: &str) -> bool {
        match self {
            Self::SqlStateClass(class) => code.chars().count() == 5 && code.starts_with(class),
            Self::Exact(expected) => code == expected,
        }
    }
}

/// Postgres response codes that we cannot recover from by retrying.
const FATAL_CODE_PATTERNS: &[CodePattern] = &[
    // Class 22: data exception, e.g. a data type mismatch.
    CodePattern::SqlStateClass("22"),
    // Class 23: integrity constraint violation (NOT NULL, FOREIGN KEY, UNIQUE).
    CodePattern::SqlStateClass("23"),
    // Insufficient privilege, typically a row-level security violation.
    CodePattern::Exact("42501"),
];

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// An error with no provider code (connection refused, timeout, bad body).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.code.as_deref() {
            Some(code) if FATAL_CODE_PATTERNS.iter().any(|p| p.matches(code)) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}
