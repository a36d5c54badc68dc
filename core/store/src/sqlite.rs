//! SQLite backend: documents, sync cursors and the change log in one file.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use tideline_common::{CollectionPath, Document, DocumentKey, Error, Result, SyncCursor};

use crate::backend::{ChangeLogBackend, DocumentBackend, DocumentWrite};
use crate::changelog::{ChangeEntry, FailedChange};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        key TEXT PRIMARY KEY,
        collection TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

    CREATE TABLE IF NOT EXISTS sync_cursors (
        collection TEXT PRIMARY KEY,
        sequence INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS change_log (
        id INTEGER PRIMARY KEY,
        doc_key TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS failed_changes (
        id INTEGER PRIMARY KEY,
        doc_key TEXT NOT NULL,
        body TEXT NOT NULL,
        reason TEXT NOT NULL,
        failed_at TEXT NOT NULL
    );
"#;

fn db_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// SQLite-backed persistence for a replica.
///
/// One connection serves both the document tables and the change log
/// tables; every trait call runs in its own transaction.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!("Local database opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }

    fn decode_document(key: &str, body: &str) -> Result<Document> {
        serde_json::from_str(body).map_err(|e| Error::corruption(key, e))
    }
}

impl DocumentBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn load(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let conn = self.conn()?;
        let key_str = key.to_string();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE key = ?1",
                params![key_str],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        body.map(|b| Self::decode_document(&key_str, &b)).transpose()
    }

    fn write(&self, write: DocumentWrite<'_>, cursor: Option<&SyncCursor>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        match write {
            DocumentWrite::Upsert(doc) => {
                let body = serde_json::to_string(doc)?;
                tx.execute(
                    "INSERT OR REPLACE INTO documents (key, collection, body) VALUES (?1, ?2, ?3)",
                    params![doc.key.to_string(), doc.collection().as_string(), body],
                )
                .map_err(db_err)?;
            }
            DocumentWrite::Purge(key) => {
                tx.execute(
                    "DELETE FROM documents WHERE key = ?1",
                    params![key.to_string()],
                )
                .map_err(db_err)?;
            }
        }

        if let Some(cursor) = cursor {
            tx.execute(
                "INSERT OR REPLACE INTO sync_cursors (collection, sequence) VALUES (?1, ?2)",
                params![cursor.collection.as_string(), cursor.sequence as i64],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)
    }

    fn scan(&self, collection: &CollectionPath) -> Result<Vec<Result<Document>>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key, body FROM documents WHERE collection = ?1 ORDER BY key")
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![collection.as_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut documents = Vec::new();
        for row in rows {
            let (key, body) = row.map_err(db_err)?;
            documents.push(Self::decode_document(&key, &body));
        }
        Ok(documents)
    }

    fn load_cursor(&self, collection: &CollectionPath) -> Result<Option<SyncCursor>> {
        let conn = self.conn()?;
        let sequence: Option<i64> = conn
            .query_row(
                "SELECT sequence FROM sync_cursors WHERE collection = ?1",
                params![collection.as_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        Ok(sequence.map(|s| SyncCursor::new(collection.clone(), s as u64)))
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_cursors (collection, sequence) VALUES (?1, ?2)",
            params![cursor.collection.as_string(), cursor.sequence as i64],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl ChangeLogBackend for SqliteBackend {
    fn load_pending(&self) -> Result<Vec<ChangeEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, body FROM change_log ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, body) = row.map_err(db_err)?;
            match serde_json::from_str::<ChangeEntry>(&body) {
                Ok(entry) => entries.push(entry),
                // The row stays in place so nothing is silently dropped.
                Err(e) => error!("Skipping undecodable change log entry {}: {}", id, e),
            }
        }
        Ok(entries)
    }

    fn load_failed(&self) -> Result<Vec<FailedChange>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, body, reason, failed_at FROM failed_changes ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut failed = Vec::new();
        for row in rows {
            let (id, body, reason, failed_at) = row.map_err(db_err)?;
            let entry: ChangeEntry = match serde_json::from_str(&body) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Skipping undecodable failed change {}: {}", id, e);
                    continue;
                }
            };
            let failed_at = DateTime::parse_from_rfc3339(&failed_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            failed.push(FailedChange {
                entry,
                reason,
                failed_at,
            });
        }
        Ok(failed)
    }

    fn max_id(&self) -> Result<u64> {
        let conn = self.conn()?;
        let max: i64 = conn
            .query_row(
                "SELECT MAX(m) FROM (
                    SELECT COALESCE(MAX(id), 0) AS m FROM change_log
                    UNION ALL
                    SELECT COALESCE(MAX(id), 0) AS m FROM failed_changes
                )",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(max as u64)
    }

    fn insert(&self, entry: &ChangeEntry) -> Result<()> {
        let body = serde_json::to_string(entry)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO change_log (id, doc_key, body) VALUES (?1, ?2, ?3)",
            params![entry.id as i64, entry.key.to_string(), body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn replace(&self, ids: &[u64], replacement: Option<&ChangeEntry>) -> Result<()> {
        let body = replacement.map(serde_json::to_string).transpose()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        for id in ids {
            tx.execute("DELETE FROM change_log WHERE id = ?1", params![*id as i64])
                .map_err(db_err)?;
        }
        if let (Some(entry), Some(body)) = (replacement, body) {
            tx.execute(
                "INSERT INTO change_log (id, doc_key, body) VALUES (?1, ?2, ?3)",
                params![entry.id as i64, entry.key.to_string(), body],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        debug!("Change log replaced {} entries", ids.len());
        Ok(())
    }

    fn record_failed(&self, failed: &[FailedChange]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        for change in failed {
            let body = serde_json::to_string(&change.entry)?;
            let id = change.entry.id as i64;
            tx.execute("DELETE FROM change_log WHERE id = ?1", params![id])
                .map_err(db_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO failed_changes (id, doc_key, body, reason, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    change.entry.key.to_string(),
                    body,
                    change.reason,
                    change.failed_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)
    }
}
