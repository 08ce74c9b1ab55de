//! SQLite persistence: users, face signatures, runtime settings, audit log.

use crate::settings::{self, SettingsSource};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use warden_core::{CatalogError, Signature, SignatureRecord, SignatureSource};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode audit details: {0}")]
    Encode(#[from] serde_json::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    email           TEXT,
    is_owner        INTEGER NOT NULL DEFAULT 0,
    is_blacklisted  INTEGER NOT NULL DEFAULT 0,
    custom_message  TEXT,
    is_active       INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS face_signatures (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    signature   BLOB NOT NULL,
    image_path  TEXT,
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type  TEXT NOT NULL,
    user_id     INTEGER REFERENCES users(id),
    details     TEXT,
    image_path  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_face_user ON face_signatures(user_id);
CREATE INDEX IF NOT EXISTS idx_logs_type ON logs(event_type, created_at);
"#;

/// One row to append to the audit log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub kind: String,
    pub owner_id: Option<i64>,
    pub details: serde_json::Value,
    pub image_ref: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only audit sink.
pub trait AuditLog: Send + Sync {
    fn append_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

/// An audit row as read back for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub event_type: String,
    pub user_id: Option<i64>,
    pub details: serde_json::Value,
    pub image_path: Option<String>,
    pub created_at: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and seed default settings.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        for (key, value) in settings::DEFAULTS {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn()
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    /// Most recent audit rows first, optionally only those of `kind`.
    pub fn recent_logs(&self, limit: u32, kind: Option<&str>) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_type, user_id, details, image_path, created_at
             FROM logs
             WHERE (?1 IS NULL OR event_type = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind, limit as i64], |r| {
            let details: Option<String> = r.get(3)?;
            Ok(LogEntry {
                id: r.get(0)?,
                event_type: r.get(1)?,
                user_id: r.get(2)?,
                details: details
                    .and_then(|d| serde_json::from_str(&d).ok())
                    .unwrap_or(serde_json::Value::Null),
                image_path: r.get(4)?,
                created_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    #[cfg(test)]
    pub fn insert_user(
        &self,
        name: &str,
        is_owner: bool,
        is_blacklisted: bool,
        custom_message: Option<&str>,
    ) -> i64 {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (name, is_owner, is_blacklisted, custom_message) VALUES (?1, ?2, ?3, ?4)",
            params![name, is_owner, is_blacklisted, custom_message],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[cfg(test)]
    pub fn add_signature(&self, user_id: i64, signature: &Signature) -> i64 {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO face_signatures (user_id, signature) VALUES (?1, ?2)",
            params![user_id, signature.to_le_bytes()],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[cfg(test)]
    pub fn deactivate_user(&self, user_id: i64) {
        self.conn()
            .execute("UPDATE users SET is_active = 0 WHERE id = ?1", params![user_id])
            .unwrap();
    }
}

impl SignatureSource for Store {
    fn load_all_signatures(&self) -> Result<Vec<SignatureRecord>, CatalogError> {
        let unavailable = |e: rusqlite::Error| CatalogError::SourceUnavailable(e.to_string());

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT f.id, f.signature, u.id, u.name, u.is_owner, u.is_blacklisted, u.custom_message
                 FROM face_signatures f
                 JOIN users u ON u.id = f.user_id
                 WHERE u.is_active = 1
                 ORDER BY f.id",
            )
            .map_err(unavailable)?;

        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, bool>(4)?,
                    r.get::<_, bool>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(unavailable)?;

        let mut records = Vec::new();
        for row in rows {
            let (source_id, blob, owner_id, display_name, is_owner, is_blacklisted, custom_message) =
                row.map_err(unavailable)?;
            let Some(signature) = Signature::from_le_bytes(&blob) else {
                tracing::warn!(id = source_id, len = blob.len(), "skipping undecodable signature");
                continue;
            };
            records.push(SignatureRecord {
                owner_id,
                display_name,
                is_owner,
                is_blacklisted,
                custom_message,
                signature,
                source_id,
            });
        }
        Ok(records)
    }
}

impl AuditLog for Store {
    fn append_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let details = serde_json::to_string(&record.details)?;
        self.conn().execute(
            "INSERT INTO logs (event_type, user_id, details, image_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.kind,
                record.owner_id,
                details,
                record.image_ref,
                record.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl SettingsSource for Store {
    fn setting(&self, key: &str) -> Option<String> {
        match self.get_setting(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "settings read failed; using default");
                None
            }
        }
    }
}
