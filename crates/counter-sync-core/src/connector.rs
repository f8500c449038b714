use async_trait::async_trait;

use crate::auth::{Credentials, Session};
use crate::error::Result;
use crate::mutation::MutationQueue;

/// Lifecycle notifications fired by a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// The connector finished loading any stored session.
    Initialized,
    SessionStarted(Session),
    SessionEnded,
}

/// The backend role the sync engine talks to.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Endpoint and bearer token for the sync service.
    ///
    /// Fails with `SyncError::NoSession` when no session is available; the
    /// caller should treat that as "cannot connect now, retry later".
    async fn fetch_credentials(&self) -> Result<Credentials>;

    /// Replay at most one pending transaction from `queue` to the backend.
    ///
    /// Not reentrant: callers must not start a second upload while one is
    /// still running against the same queue.
    async fn upload_data(&self, queue: &dyn MutationQueue) -> Result<()>;
}
