//! SQLite backend (bundled SQLite via rusqlite).
//!
//! Timestamps are stored as RFC 3339 text, binary fields as BLOBs.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::crypto::SealedBlob;
use crate::storage::error::StorageError;
use crate::storage::traits::VaultStorage;
use crate::storage::types::{OutboxOperation, RecordType, StoredRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    record_id      TEXT PRIMARY KEY,
    record_type    TEXT NOT NULL,
    ciphertext     BLOB NOT NULL,
    iv             BLOB NOT NULL,
    tag            BLOB NOT NULL,
    version        INTEGER NOT NULL CHECK (version >= 1),
    server_version INTEGER,
    deleted        INTEGER NOT NULL DEFAULT 0,
    conflict_ref   TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id              TEXT PRIMARY KEY,
    record_id       TEXT NOT NULL UNIQUE,
    record_type     TEXT NOT NULL,
    base_version    INTEGER,
    ciphertext      BLOB NOT NULL,
    deleted         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    retries         INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const RECORD_COLUMNS: &str = "record_id, record_type, ciphertext, iv, tag, version, \
     server_version, deleted, conflict_ref, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, record_id, record_type, base_version, ciphertext, deleted, \
     created_at, retries, last_attempt_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "opened sqlite vault storage");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Fixed-width UTC form so lexical order matches time order.
fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            message: format!("timestamp {raw:?}: {e}"),
        })
}

fn parse_type(table: &'static str, raw: &str) -> Result<RecordType, StorageError> {
    raw.parse()
        .map_err(|message| StorageError::Corrupt { table, message })
}

/// Raw column values; conversion happens outside the rusqlite row callback
/// so corruption surfaces as `StorageError::Corrupt`.
struct RecordRow {
    record_id: String,
    record_type: String,
    ciphertext: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
    version: i64,
    server_version: Option<i64>,
    deleted: bool,
    conflict_ref: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            record_type: row.get(1)?,
            ciphertext: row.get(2)?,
            iv: row.get(3)?,
            tag: row.get(4)?,
            version: row.get(5)?,
            server_version: row.get(6)?,
            deleted: row.get(7)?,
            conflict_ref: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<StoredRecord, StorageError> {
        let blob =
            SealedBlob::from_parts(&self.iv, self.ciphertext, &self.tag).map_err(|e| {
                StorageError::Corrupt {
                    table: "records",
                    message: e.to_string(),
                }
            })?;
        Ok(StoredRecord {
            record_type: parse_type("records", &self.record_type)?,
            record_id: self.record_id,
            blob,
            version: self.version,
            server_version: self.server_version,
            deleted: self.deleted,
            conflict_ref: self.conflict_ref,
            created_at: parse_time("records", &self.created_at)?,
            updated_at: parse_time("records", &self.updated_at)?,
        })
    }
}

struct OutboxRow {
    id: String,
    record_id: String,
    record_type: String,
    base_version: Option<i64>,
    ciphertext: Vec<u8>,
    deleted: bool,
    created_at: String,
    retries: u32,
    last_attempt_at: Option<String>,
}

impl OutboxRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            record_id: row.get(1)?,
            record_type: row.get(2)?,
            base_version: row.get(3)?,
            ciphertext: row.get(4)?,
            deleted: row.get(5)?,
            created_at: row.get(6)?,
            retries: row.get(7)?,
            last_attempt_at: row.get(8)?,
        })
    }

    fn into_op(self) -> Result<OutboxOperation, StorageError> {
        Ok(OutboxOperation {
            record_type: parse_type("outbox", &self.record_type)?,
            created_at: parse_time("outbox", &self.created_at)?,
            last_attempt_at: self
                .last_attempt_at
                .as_deref()
                .map(|raw| parse_time("outbox", raw))
                .transpose()?,
            id: self.id,
            record_id: self.record_id,
            base_version: self.base_version,
            ciphertext: self.ciphertext,
            deleted: self.deleted,
            retries: self.retries,
        })
    }
}

impl VaultStorage for SqliteStorage {
    fn get_record(&self, record_id: &str) -> Result<Option<StoredRecord>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"),
                params![record_id],
                RecordRow::read,
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    fn put_record(&self, record: &StoredRecord) -> Result<(), StorageError> {
        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO records ({RECORD_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.record_id,
                record.record_type.as_str(),
                record.blob.ciphertext,
                &record.blob.iv[..],
                &record.blob.tag[..],
                record.version,
                record.server_version,
                record.deleted,
                record.conflict_ref,
                fmt_time(&record.created_at),
                fmt_time(&record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY record_id"))?;
        let rows = stmt
            .query_map([], RecordRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn clear_records(&self) -> Result<(), StorageError> {
        self.conn.lock().execute("DELETE FROM records", [])?;
        Ok(())
    }

    fn get_outbox_for_record(
        &self,
        record_id: &str,
    ) -> Result<Option<OutboxOperation>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE record_id = ?1"),
                params![record_id],
                OutboxRow::read,
            )
            .optional()?;
        row.map(OutboxRow::into_op).transpose()
    }

    fn put_outbox(&self, op: &OutboxOperation) -> Result<(), StorageError> {
        // REPLACE drops whichever row collides on id or on record_id.
        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO outbox ({OUTBOX_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                op.id,
                op.record_id,
                op.record_type.as_str(),
                op.base_version,
                op.ciphertext,
                op.deleted,
                fmt_time(&op.created_at),
                op.retries,
                op.last_attempt_at.as_ref().map(fmt_time),
            ],
        )?;
        Ok(())
    }

    fn remove_outbox(&self, op_id: &str) -> Result<bool, StorageError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM outbox WHERE id = ?1", params![op_id])?;
        Ok(n > 0)
    }

    fn scan_outbox(&self) -> Result<Vec<OutboxOperation>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], OutboxRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OutboxRow::into_op).collect()
    }

    fn clear_outbox(&self) -> Result<(), StorageError> {
        self.conn.lock().execute("DELETE FROM outbox", [])?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }
}
