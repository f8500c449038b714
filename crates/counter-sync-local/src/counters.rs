//! The `counters` table: one counter per owner.

use chrono::{SecondsFormat, Utc};
use counter_sync_core::MutationOp;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::database::{LocalDatabase, WriteBatch};
use crate::error::{LocalError, Result};

pub const COUNTER_TABLE: &str = "counters";

const COUNTER_BY_OWNER: &str = "SELECT id, owner_id, count, created_at FROM counters \
                                WHERE owner_id = ?1 ORDER BY created_at LIMIT 1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub owner_id: String,
    pub count: i64,
    /// RFC 3339 creation timestamp
    pub created_at: String,
}

impl Counter {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            count: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    /// Upload payload (everything except the primary key).
    fn payload(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("owner_id".to_string(), json!(self.owner_id));
        data.insert("count".to_string(), json!(self.count));
        data.insert("created_at".to_string(), json!(self.created_at));
        data
    }
}

impl WriteBatch<'_> {
    pub fn counter_for_owner(&self, owner_id: &str) -> Result<Option<Counter>> {
        self.query_optional(COUNTER_BY_OWNER, params![owner_id], Counter::from_row)
    }

    pub fn insert_counter(&mut self, counter: &Counter) -> Result<()> {
        self.connection().execute(
            "INSERT INTO counters (id, owner_id, count, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![counter.id, counter.owner_id, counter.count, counter.created_at],
        )?;
        self.record(&MutationOp::put(
            COUNTER_TABLE,
            counter.id.clone(),
            counter.payload(),
        ))
    }

    pub fn set_count(&mut self, id: &str, count: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE counters SET count = ?1 WHERE id = ?2",
            params![count, id],
        )?;
        let mut patch = Map::new();
        patch.insert("count".to_string(), json!(count));
        self.record(&MutationOp::patch(COUNTER_TABLE, id, patch))
    }

    /// Returns false when no such row exists (nothing is recorded then).
    pub fn delete_counter(&mut self, id: &str) -> Result<bool> {
        let deleted = self
            .connection()
            .execute("DELETE FROM counters WHERE id = ?1", params![id])?;
        if deleted > 0 {
            self.record(&MutationOp::delete(COUNTER_TABLE, id))?;
        }
        Ok(deleted > 0)
    }
}

impl LocalDatabase {
    /// All counters, oldest first.
    pub fn counters(&self) -> Result<Vec<Counter>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, count, created_at FROM counters ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], Counter::from_row)?;
        let mut counters = Vec::new();
        for counter in rows {
            counters.push(counter?);
        }
        Ok(counters)
    }

    pub fn counter_for_owner(&self, owner_id: &str) -> Result<Option<Counter>> {
        let conn = self.lock();
        let counter = conn
            .query_row(COUNTER_BY_OWNER, params![owner_id], Counter::from_row)
            .optional()?;
        Ok(counter)
    }

    /// Create a counter starting at zero. An owner may only have one.
    pub fn create_counter(&self, owner_id: &str) -> Result<Counter> {
        self.write(|batch| {
            if batch.counter_for_owner(owner_id)?.is_some() {
                return Err(LocalError::CounterExists(owner_id.to_string()));
            }
            let counter = Counter {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                count: 0,
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            };
            batch.insert_counter(&counter)?;
            Ok(counter)
        })
    }

    /// Add one to the owner's counter and return the new value.
    pub fn increment_counter(&self, owner_id: &str) -> Result<Counter> {
        self.write(|batch| {
            let mut counter = batch
                .counter_for_owner(owner_id)?
                .ok_or_else(|| LocalError::CounterNotFound(owner_id.to_string()))?;
            counter.count += 1;
            batch.set_count(&counter.id, counter.count)?;
            Ok(counter)
        })
    }

    pub fn delete_counter(&self, id: &str) -> Result<bool> {
        self.write(|batch| batch.delete_counter(id))
    }
}
