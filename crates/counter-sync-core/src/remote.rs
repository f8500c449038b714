use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RemoteError;

/// Row-level writes against named remote tables, matched by `id`.
///
/// Implementations must tolerate replays: the bridge re-sends a whole
/// transaction after a transient failure, so an upsert or delete may arrive
/// twice.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or fully replace the row identified by `row["id"]`.
    async fn upsert(&self, table: &str, row: &Map<String, Value>) -> Result<(), RemoteError>;

    /// Update the given columns of the row matching `id`.
    async fn update(
        &self,
        table: &str,
        patch: &Map<String, Value>,
        id: &str,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}
