use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use counter_sync_core::{MutationOp, MutationQueue, MutationTransaction};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS counters (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS crud_tx (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);
CREATE TABLE IF NOT EXISTS crud_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS crud_log_tx ON crud_log (tx_id);
";

/// Local SQLite database holding app tables and the pending crud log.
pub struct LocalDatabase {
    conn: Mutex<Connection>,
    /// Bumped after every commit that recorded at least one crud entry.
    changes: watch::Sender<u64>,
}

impl LocalDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        info!("Opened local database at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("local database poisoned")
    }

    /// Receiver that observes a new value after each local commit.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Run `f` inside one SQLite transaction.
    ///
    /// All crud entries recorded by `f` share one transaction id and are
    /// replayed together. If `f` fails nothing is committed.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteBatch<'_>) -> Result<T>) -> Result<T> {
        let (value, recorded) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let (value, recorded) = {
                let mut batch = WriteBatch {
                    tx: &tx,
                    tx_id: None,
                    recorded: 0,
                };
                let value = f(&mut batch)?;
                (value, batch.recorded)
            };
            tx.commit()?;
            (value, recorded)
        };

        if recorded > 0 {
            self.changes.send_modify(|version| *version += 1);
        }
        Ok(value)
    }

    /// Number of transactions waiting for upload.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(DISTINCT tx_id) FROM crud_log", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    fn next_pending(&self) -> Result<Option<MutationTransaction>> {
        let conn = self.lock();
        let tx_id: Option<i64> =
            conn.query_row("SELECT MIN(tx_id) FROM crud_log", [], |row| row.get(0))?;
        let Some(tx_id) = tx_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT data FROM crud_log WHERE tx_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![tx_id], |row| row.get::<_, String>(0))?;
        let mut ops = Vec::new();
        for data in rows {
            let op: MutationOp = serde_json::from_str(&data?)?;
            ops.push(op);
        }

        Ok(Some(MutationTransaction { tx_id, ops }))
    }

    fn remove_transaction(&self, tx_id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM crud_log WHERE tx_id = ?1", params![tx_id])?;
        tx.execute("DELETE FROM crud_tx WHERE id = ?1", params![tx_id])?;
        tx.commit()?;
        debug!("Removed transaction {} ({} entries)", tx_id, removed);
        Ok(())
    }
}

#[async_trait]
impl MutationQueue for LocalDatabase {
    async fn next_pending_transaction(
        &self,
    ) -> counter_sync_core::Result<Option<MutationTransaction>> {
        Ok(self.next_pending()?)
    }

    async fn complete(&self, transaction: &MutationTransaction) -> counter_sync_core::Result<()> {
        Ok(self.remove_transaction(transaction.tx_id)?)
    }
}

/// Handle passed to [`LocalDatabase::write`] closures.
pub struct WriteBatch<'a> {
    tx: &'a Transaction<'a>,
    tx_id: Option<i64>,
    recorded: usize,
}

impl WriteBatch<'_> {
    pub(crate) fn connection(&self) -> &Connection {
        self.tx
    }

    /// Append `op` to the crud log as part of this batch's transaction.
    pub fn record(&mut self, op: &MutationOp) -> Result<()> {
        let tx_id = match self.tx_id {
            Some(id) => id,
            None => {
                self.tx.execute("INSERT INTO crud_tx DEFAULT VALUES", [])?;
                let id = self.tx.last_insert_rowid();
                self.tx_id = Some(id);
                id
            }
        };

        let data = serde_json::to_string(op)?;
        self.tx.execute(
            "INSERT INTO crud_log (tx_id, data) VALUES (?1, ?2)",
            params![tx_id, data],
        )?;
        self.recorded += 1;
        debug!("Recorded {:?} {}/{} in transaction {}", op.kind, op.table, op.id, tx_id);
        Ok(())
    }

    pub(crate) fn query_optional<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        Ok(self.tx.query_row(sql, params, map).optional()?)
    }
}
