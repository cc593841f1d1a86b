//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every successful insert is
//! broadcast to subscribers so the relay can react to new records.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, MessageRecord, NewMessage, Sender};

/// Capacity of the creation-event broadcast buffer.
const EVENT_BUFFER: usize = 256;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    events: broadcast::Sender<MessageRecord>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            db: Arc::new(db),
            conn,
            events,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a SELECT over `MESSAGE_COLUMNS` and collect every parseable row.
    async fn query_messages(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_message(&row) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => warn!(op, "Skipping message row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(messages)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so lexical order matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a MessageRecord.
///
/// Column order matches MESSAGE_COLUMNS:
/// 0:id, 1:sender, 2:message, 3:response_to, 4:created_at
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let id: String = row.get(0).map_err(parse_err)?;
    let sender_str: String = row.get(1).map_err(parse_err)?;
    let message_str: String = row.get(2).map_err(parse_err)?;
    let response_to: Option<String> = row.get(3).ok();
    let created_str: String = row.get(4).map_err(parse_err)?;

    let sender = sender_str
        .parse::<Sender>()
        .map_err(DatabaseError::Serialization)?;
    let message: serde_json::Value = serde_json::from_str(&message_str)
        .map_err(|e| DatabaseError::Serialization(format!("message {id}: {e}")))?;

    Ok(MessageRecord {
        id,
        sender,
        message,
        response_to,
        timestamp: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, sender, message, response_to, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, DatabaseError> {
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            sender: message.sender,
            message: message.message,
            response_to: message.response_to,
            // Stored precision, so the returned record equals what a read yields.
            timestamp: Utc::now().trunc_subsecs(6),
        };
        let body = serde_json::to_string(&record.message)
            .map_err(|e| DatabaseError::Serialization(format!("insert_message: {e}")))?;

        self.conn()
            .execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    record.id.clone(),
                    record.sender.as_str(),
                    body,
                    opt_text_owned(record.response_to.clone()),
                    format_timestamp(record.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(id = %record.id, sender = %record.sender, "Message inserted into DB");

        // No subscribers is not an error.
        let _ = self.events.send(record.clone());
        Ok(record)
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut found = self
            .query_messages(
                "get_message",
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(found.pop())
    }

    async fn find_answer(&self, text: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut found = self
            .query_messages(
                "find_answer",
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender = 'ai' AND response_to = ?1 LIMIT 1"
                ),
                params![text],
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, DatabaseError> {
        // Newest `limit` rows, returned oldest first.
        self.query_messages(
            "list_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT {MESSAGE_COLUMNS}, rowid AS seq FROM messages
                    ORDER BY created_at DESC, rowid DESC LIMIT ?1
                 ) ORDER BY created_at ASC, seq ASC"
            ),
            params![limit as i64],
        )
        .await
    }

    async fn list_unanswered(
        &self,
        after: Option<&MessageRecord>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let (after_ts, after_id) = match after {
            Some(record) => (
                Some(format_timestamp(record.timestamp)),
                Some(record.id.clone()),
            ),
            None => (None, None),
        };
        self.query_messages(
            "list_unanswered",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.sender = 'user'
                   AND json_type(m.message) = 'text'
                   AND json_extract(m.message, '$') != ''
                   AND NOT EXISTS (
                       SELECT 1 FROM messages a
                       WHERE a.sender = 'ai' AND a.response_to = json_extract(m.message, '$')
                   )
                   AND (?2 IS NULL OR (m.created_at, m.id) > (?2, ?3))
                 ORDER BY m.created_at ASC, m.id ASC LIMIT ?1"
            ),
            params![limit as i64, opt_text_owned(after_ts), opt_text_owned(after_id)],
        )
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageRecord> {
        self.events.subscribe()
    }
}
