use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;

/// Kind of change recorded for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    /// Full upsert of the row.
    Put,
    /// Partial update of the columns present in `data`.
    Patch,
    Delete,
}

/// A single pending change to one remote row.
///
/// Serialized as a crud log entry:
/// `{"op": "PUT", "type": "counters", "id": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOp {
    #[serde(rename = "op")]
    pub kind: OpKind,
    /// Target remote table
    #[serde(rename = "type")]
    pub table: String,
    /// Row primary key, stable across local and remote stores
    pub id: String,
    /// Column values (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl MutationOp {
    pub fn put(table: impl Into<String>, id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: OpKind::Put,
            table: table.into(),
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn patch(
        table: impl Into<String>,
        id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            kind: OpKind::Patch,
            table: table.into(),
            id: id.into(),
            data: Some(data),
        }
    }

    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            table: table.into(),
            id: id.into(),
            data: None,
        }
    }

    /// Row sent on upsert: the payload with `id` set to the op's id.
    pub fn upsert_row(&self) -> Map<String, Value> {
        let mut row = self.data.clone().unwrap_or_default();
        row.insert("id".to_string(), Value::String(self.id.clone()));
        row
    }

    /// Columns sent on a partial update.
    pub fn patch_data(&self) -> Map<String, Value> {
        self.data.clone().unwrap_or_default()
    }
}

/// One durable local commit: ops that must be replayed in order.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationTransaction {
    /// Queue-assigned identifier, increasing in commit order
    pub tx_id: i64,
    pub ops: Vec<MutationOp>,
}

/// Ordered, durable log of locally committed transactions.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// The oldest transaction not yet completed, if any.
    ///
    /// Until it is completed, every call returns the same transaction.
    async fn next_pending_transaction(&self) -> Result<Option<MutationTransaction>>;

    /// Remove the transaction from the pending queue. Idempotent.
    async fn complete(&self, transaction: &MutationTransaction) -> Result<()>;
}

/// In-memory queue, for wiring tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryMutationQueue {
    inner: Mutex<MemoryQueueState>,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    pending: VecDeque<MutationTransaction>,
    last_tx_id: i64,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `ops` as one transaction and return its id.
    pub fn push(&self, ops: Vec<MutationOp>) -> i64 {
        let mut state = self.inner.lock().expect("mutation queue poisoned");
        state.last_tx_id += 1;
        let tx_id = state.last_tx_id;
        state.pending.push_back(MutationTransaction { tx_id, ops });
        tx_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mutation queue poisoned").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MutationQueue for MemoryMutationQueue {
    async fn next_pending_transaction(&self) -> Result<Option<MutationTransaction>> {
        let state = self.inner.lock().expect("mutation queue poisoned");
        Ok(state.pending.front().cloned())
    }

    async fn complete(&self, transaction: &MutationTransaction) -> Result<()> {
        let mut state = self.inner.lock().expect("mutation queue poisoned");
        state.pending.retain(|tx| tx.tx_id != transaction.tx_id);
        debug!("Completed transaction {}", transaction.tx_id);
        Ok(())
    }
}
