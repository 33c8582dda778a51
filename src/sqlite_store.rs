// src/sqlite_store.rs

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::PersistenceError;
use crate::models::{TransferId, TransferRecord};
use crate::store::{ParentScope, TransferQuery, TransferStore};

/// Row ready to be written: `(id, parent_id, state, record_json)`.
type Row = (String, Option<String>, &'static str, String);

/// Persists transfer records to an SQLite database.
///
/// Each record is stored as JSON next to the columns the manager queries by.
pub struct SqliteTransferStore {
    conn: Connection,
}

impl SqliteTransferStore {
    /// Opens (or creates) the database file and its schema.
    pub async fn open(db_path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        debug!(path = %db_path.display(), "transfer store opened");
        Ok(store)
    }

    /// A database that lives only as long as this value.
    pub async fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), PersistenceError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = FULL;
                     CREATE TABLE IF NOT EXISTS transfers (
                         id          TEXT PRIMARY KEY,
                         parent_id   TEXT,
                         state       TEXT NOT NULL,
                         record      TEXT NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS transfers_parent ON transfers (parent_id);
                     CREATE INDEX IF NOT EXISTS transfers_state ON transfers (state);",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn to_row(record: &TransferRecord) -> Result<Row, PersistenceError> {
        Ok((
            record.id.to_string(),
            record.parent_id.map(|p| p.to_string()),
            record.state.as_str(),
            serde_json::to_string(record)?,
        ))
    }
}

fn decode(json: &str) -> Result<TransferRecord, rusqlite::Error> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl TransferStore for SqliteTransferStore {
    async fn save(&self, record: &TransferRecord) -> Result<(), PersistenceError> {
        self.save_all(std::slice::from_ref(record)).await
    }

    async fn save_all(&self, records: &[TransferRecord]) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(Self::to_row)
            .collect::<Result<Vec<Row>, PersistenceError>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (id, parent_id, state, record) in &rows {
                    tx.execute(
                        "INSERT INTO transfers (id, parent_id, state, record)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(id) DO UPDATE SET
                             parent_id = excluded.parent_id,
                             state = excluded.state,
                             record = excluded.record",
                        params![id, parent_id, state, record],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load(&self, id: &TransferId) -> Result<Option<TransferRecord>, PersistenceError> {
        let key = id.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let json: Option<String> = conn
                    .query_row(
                        "SELECT record FROM transfers WHERE id = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let record = match json {
                    Some(json) => Some(decode(&json)?),
                    None => None,
                };
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    async fn query(&self, query: &TransferQuery) -> Result<Vec<TransferRecord>, PersistenceError> {
        let mut sql = String::from("SELECT record FROM transfers WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();
        match query.scope {
            ParentScope::TopLevel => sql.push_str(" AND parent_id IS NULL"),
            ParentScope::ChildrenOf(parent) => {
                args.push(parent.to_string());
                sql.push_str(&format!(" AND parent_id = ?{}", args.len()));
            }
            ParentScope::Any => {}
        }
        if let Some(states) = &query.states {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let mut placeholders = Vec::with_capacity(states.len());
            for state in states {
                args.push(state.as_str().to_string());
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY rowid");

        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                    let json: String = row.get(0)?;
                    decode(&json)
                })?;
                let records: Vec<TransferRecord> = rows.collect::<Result<_, rusqlite::Error>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    async fn delete(&self, id: &TransferId) -> Result<(), PersistenceError> {
        let key = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM transfers WHERE parent_id = ?1", params![key])?;
                tx.execute("DELETE FROM transfers WHERE id = ?1", params![key])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
