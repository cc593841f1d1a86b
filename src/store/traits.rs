//! `Database` trait and the message record model it persists.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::DatabaseError;

/// Who authored a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// Typed by a person; triggers the relay.
    User,
    /// Written by the relay in answer to a user record.
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Sender::User),
            "ai" => Ok(Sender::Ai),
            other => Err(format!("unknown sender: {other}")),
        }
    }
}

/// A persisted message record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Store-assigned identifier.
    pub id: String,
    pub sender: Sender,
    /// Plain text for `user` records, an arbitrary JSON payload for `ai` records.
    pub message: Value,
    /// Text of the user message this record answers (`ai` records only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    /// Store-assigned creation time.
    pub timestamp: DateTime<Utc>,
}

impl MessageRecord {
    /// The message text, if this record carries a plain string.
    pub fn text(&self) -> Option<&str> {
        self.message.as_str()
    }
}

/// A record about to be appended. The store fills in `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender: Sender,
    pub message: Value,
    pub response_to: Option<String>,
}

impl NewMessage {
    /// A user-authored text message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            message: Value::String(text.into()),
            response_to: None,
        }
    }

    /// An answer record for the user message with text `response_to`.
    pub fn answer(response_to: impl Into<String>, payload: Value) -> Self {
        Self {
            sender: Sender::Ai,
            message: payload,
            response_to: Some(response_to.into()),
        }
    }
}

/// Append-only message store with equality lookups and creation events.
///
/// Records are write-once; the trait exposes no update or delete.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Append a record as one atomic insert and broadcast it to subscribers.
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, DatabaseError>;

    /// Get a record by ID.
    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    /// First `ai` record whose `response_to` equals `text` (limit 1).
    async fn find_answer(&self, text: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Records ordered by creation time, oldest first, up to `limit`.
    async fn list_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// User records with no matching `ai` record, oldest first, up to `limit`.
    ///
    /// With `after`, only records that sort strictly after it by
    /// `(timestamp, id)` are returned, so callers can page through a backlog.
    async fn list_unanswered(
        &self,
        after: Option<&MessageRecord>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    /// Subscribe to records appended after this call.
    fn subscribe(&self) -> broadcast::Receiver<MessageRecord>;
}
