//! Relational store backend.
//!
//! A single `studies` table in one SQLite database file. Applied migrations
//! are tracked in a `migrations` table keyed by declaration order, so
//! reopening an existing file replays nothing. All calls run on the blocking
//! thread pool; the connection is serialized behind a mutex, which also
//! makes a batched insert atomic with respect to concurrent readers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ctgov2fhir_core::{ClinicalStudy, NctId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{decode_record, encode_record, StoreError, StoreStat, StudyStore};

/// Schema history, ordered by declaration. Names are recorded in the
/// `migrations` table; a recorded name is never re-applied.
const MIGRATIONS: &[(&str, &str)] = &[(
    "create-studies",
    "CREATE TABLE studies (
        nct_id INTEGER PRIMARY KEY,
        study_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
)];

pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    max_entry_size: usize,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub async fn open(path: impl Into<PathBuf>, max_entry_size: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let mut conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            migrate(&mut conn)?;
            debug!(target: "ctgovservice", path = %path.display(), "opened sqlite store");
            Ok(conn)
        })
        .await
        .expect("store worker task panicked")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            max_entry_size,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .expect("store worker task panicked")
    }
}

fn migrate(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
        [],
    )?;
    for (position, (name, ddl)) in MIGRATIONS.iter().enumerate() {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(ddl)?;
        tx.execute(
            "INSERT INTO migrations (id, name) VALUES (?1, ?2)",
            params![position as i64 + 1, name],
        )?;
        tx.commit()?;
        debug!(target: "ctgovservice", migration = name, "applied store migration");
    }
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

const UPSERT: &str = "INSERT INTO studies (nct_id, study_json, created_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(nct_id) DO UPDATE SET study_json = excluded.study_json";

#[async_trait]
impl StudyStore for SqliteStore {
    async fn put(&self, nct_id: NctId, study: &ClinicalStudy) -> Result<(), StoreError> {
        let json = encode_record(nct_id, study, self.max_entry_size)?;
        self.with_conn(move |conn| {
            conn.execute(UPSERT, params![nct_id.as_u32(), json, now_millis()])?;
            Ok(())
        })
        .await
    }

    async fn put_batch(&self, records: &[(NctId, ClinicalStudy)]) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(records.len());
        for (nct_id, study) in records {
            rows.push((nct_id.as_u32(), encode_record(*nct_id, study, self.max_entry_size)?));
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(UPSERT)?;
                let created_at = now_millis();
                for (serial, json) in &rows {
                    stmt.execute(params![serial, json, created_at])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, nct_id: NctId) -> Result<Option<ClinicalStudy>, StoreError> {
        let limit = self.max_entry_size;
        let json: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT study_json FROM studies WHERE nct_id = ?1",
                    [nct_id.as_u32()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        match json {
            Some(json) if json.len() > limit => Err(StoreError::TooLarge {
                nct_id,
                size: json.len(),
                limit,
            }),
            Some(json) => decode_record(nct_id, &json).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, nct_id: NctId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM studies WHERE nct_id = ?1", [nct_id.as_u32()])?;
            Ok(())
        })
        .await
    }

    async fn list_keys(&self) -> Result<Vec<NctId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT nct_id FROM studies ORDER BY nct_id")?;
            let serials = stmt
                .query_map([], |row| row.get::<_, u32>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(serials
                .into_iter()
                .filter_map(|serial| NctId::new(serial).ok())
                .collect())
        })
        .await
    }

    async fn stat(&self, nct_id: NctId) -> Result<Option<StoreStat>, StoreError> {
        // The schema keeps a single creation timestamp; it doubles as the
        // modification time.
        let created: Option<i64> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT created_at FROM studies WHERE nct_id = ?1",
                    [nct_id.as_u32()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        Ok(created.map(|millis| {
            let at = UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64);
            StoreStat {
                created_at: at,
                last_modified_at: at,
            }
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take() {
                // Failing to flush on close is not actionable for callers.
                let _ = conn.close();
            }
        })
        .await
        .expect("store worker task panicked");
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("max_entry_size", &self.max_entry_size)
            .finish_non_exhaustive()
    }
}
