//! Dedup guard — has this message text already been answered?

use std::sync::Arc;

use crate::error::DatabaseError;
use crate::store::Database;

/// Idempotency check keyed on the raw user message text.
///
/// No lock is taken: two concurrent invocations for the same text can both
/// see "not answered" and both go on to answer.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn Database>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// True when an `ai` record with `response_to == text` exists.
    pub async fn already_answered(&self, text: &str) -> Result<bool, DatabaseError> {
        Ok(self.store.find_answer(text).await?.is_some())
    }
}
