//! Persistence layer — libSQL-backed append-only message store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, MessageRecord, NewMessage, Sender};
