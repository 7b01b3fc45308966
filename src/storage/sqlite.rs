//! SQLite-backed storage for the durable update log.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{StoredUpdate, UpdateStorage};
use crate::doc::OriginTag;
use crate::error::Result;

/// SQLite-backed update-log storage.
///
/// Persists document snapshots and incremental updates, enabling catch-up
/// after restart and log compaction.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    ///
    /// Creates the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Document snapshots (compacted state)
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                state_vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Incremental updates
            -- No foreign key constraint since updates may arrive before the snapshot
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            -- Index for efficient catch-up queries
            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);
            "#,
        )?;
        Ok(())
    }
}

impl UpdateStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        // An unknown document is None; any other query failure is a real
        // storage error and must surface.
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        // Keep the state vector alongside the snapshot for sync handshakes.
        let state_vector = {
            let doc = Doc::new();
            {
                let mut txn = doc.transact_mut();
                if let Ok(update) = Update::decode_v1(state) {
                    let _ = txn.apply_update(update);
                }
            }
            let txn = doc.transact();
            txn.state_vector().encode_v1()
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![
                name,
                state,
                state_vector,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        conn.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        Ok(())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: OriginTag) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![
                name,
                update,
                origin.to_string(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<StoredUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE doc_name = ? AND id > ? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![name, since_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (id, data, origin, timestamp) = row?;
            updates.push(StoredUpdate {
                update_id: id,
                doc_name: name.to_string(),
                data,
                timestamp,
                origin: origin.parse().unwrap_or(OriginTag::Local),
            });
        }
        Ok(updates)
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: i64 = conn
            .query_row(
                "SELECT MAX(id) FROM updates WHERE doc_name = ?",
                params![name],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .unwrap_or(0);
        Ok(id)
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();

        // Reconstruct the full state from snapshot + all updates.
        let full_state = {
            let base_state: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT state FROM documents WHERE name = ?",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            let mut stmt =
                conn.prepare("SELECT data FROM updates WHERE doc_name = ? ORDER BY id ASC")?;
            let updates: Vec<Vec<u8>> = stmt
                .query_map(params![name], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();

            if base_state.is_none() && updates.is_empty() {
                return Ok(());
            }

            let doc = Doc::new();
            {
                let mut txn = doc.transact_mut();
                if let Some(state) = &base_state
                    && let Ok(update) = Update::decode_v1(state)
                {
                    let _ = txn.apply_update(update);
                }
                for update_data in &updates {
                    if let Ok(update) = Update::decode_v1(update_data) {
                        let _ = txn.apply_update(update);
                    }
                }
            }

            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        let update_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE doc_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        if update_count as usize <= keep_updates {
            return Ok(());
        }

        // Cutoff id: keep only the last `keep_updates` rows.
        let cutoff_id: i64 = conn
            .query_row(
                "SELECT id FROM updates WHERE doc_name = ? ORDER BY id DESC LIMIT 1 OFFSET ?",
                params![name, keep_updates.saturating_sub(1)],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let state_vector = {
            let doc = Doc::new();
            {
                let mut txn = doc.transact_mut();
                if let Ok(update) = Update::decode_v1(&full_state) {
                    let _ = txn.apply_update(update);
                }
            }
            let txn = doc.transact();
            txn.state_vector().encode_v1()
        };

        // Save the new snapshot FIRST, then delete old updates, inside one
        // SQL transaction so a crash cannot lose data.
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![
                name,
                full_state,
                state_vector,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id < ?",
            params![name, cutoff_id],
        )?;
        tx.commit()?;

        Ok(())
    }
}
