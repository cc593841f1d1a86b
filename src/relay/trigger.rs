//! Relay trigger — answers one newly created user message.
//!
//! Flow per invocation:
//! 1. Filter: only non-empty `user` records go further
//! 2. Claim the text; a second invocation for a text in flight is skipped
//! 3. Dedup guard: skip text that already has an answer
//! 4. One call to the answering service
//! 5. Classify the outcome (transport failures re-check dedup first)
//! 6. Append exactly one `ai` record
//!
//! Store failures abort the invocation and surface as `RelayError`; every
//! answering-service outcome becomes data instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::classifier::{Classification, ClassificationKind, classify};
use super::dedup::DedupGuard;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::gateway::{AnsweringService, RelayRequest};
use crate::store::{Database, MessageRecord, NewMessage, Sender};

/// Why an invocation ended without calling the answering service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Missing record, or not authored by a user.
    NotUserMessage,
    /// User record without usable text.
    EmptyMessage,
    /// An answer for this text already exists.
    AlreadyAnswered,
    /// Another invocation in this process is relaying the same text.
    InFlight,
}

/// Result of one trigger invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Skipped(SkipReason),
    /// The answering service was called and one answer record written.
    Answered {
        record: MessageRecord,
        kind: ClassificationKind,
    },
    /// The call failed, but another invocation answered the text meanwhile.
    DuplicateSuppressed,
}

/// Handler invoked once per created message record.
pub struct RelayTrigger {
    store: Arc<dyn Database>,
    gateway: Arc<dyn AnsweringService>,
    dedup: DedupGuard,
    credential: SecretString,
    in_flight: Mutex<HashSet<String>>,
}

/// Holds a text in the in-flight set until dropped.
struct InFlightClaim<'a> {
    texts: &'a Mutex<HashSet<String>>,
    text: String,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.texts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.text);
    }
}

impl RelayTrigger {
    pub fn new(
        config: &RelayConfig,
        store: Arc<dyn Database>,
        gateway: Arc<dyn AnsweringService>,
    ) -> Self {
        Self {
            dedup: DedupGuard::new(Arc::clone(&store)),
            store,
            gateway,
            credential: config.sender_credential.clone(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// `None` when another invocation already holds `text`.
    fn claim(&self, text: &str) -> Option<InFlightClaim<'_>> {
        let mut texts = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !texts.insert(text.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            texts: &self.in_flight,
            text: text.to_string(),
        })
    }

    /// React to one created record. Safe to call more than once per record.
    pub async fn handle(&self, record: Option<&MessageRecord>) -> Result<RelayOutcome, RelayError> {
        let Some(record) = record.filter(|r| r.sender == Sender::User) else {
            debug!("Message is not from a user or is empty; nothing to relay");
            return Ok(RelayOutcome::Skipped(SkipReason::NotUserMessage));
        };
        let Some(text) = record.text().filter(|t| !t.is_empty()) else {
            warn!(id = %record.id, "User message has no text; nothing to relay");
            return Ok(RelayOutcome::Skipped(SkipReason::EmptyMessage));
        };

        info!(id = %record.id, "Incoming user message");

        let Some(_claim) = self.claim(text) else {
            info!(id = %record.id, "Message already being relayed; skipping duplicate invocation");
            return Ok(RelayOutcome::Skipped(SkipReason::InFlight));
        };

        if self.already_answered(text).await? {
            info!(id = %record.id, "Message already handled; skipping duplicate response");
            return Ok(RelayOutcome::Skipped(SkipReason::AlreadyAnswered));
        }

        let request = RelayRequest {
            sender: self.credential.expose_secret().to_string(),
            message: text.to_string(),
        };
        let outcome = self.gateway.send(&request).await;

        match &outcome {
            Ok(reply) => debug!(id = %record.id, status = reply.status, "Gateway responded"),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Gateway call failed");
                if self.already_answered(text).await? {
                    info!(id = %record.id, "Answer landed meanwhile; skipping duplicate error record");
                    return Ok(RelayOutcome::DuplicateSuppressed);
                }
            }
        }

        let classification = classify(outcome);
        let kind = classification.kind();
        let answer = self.persist_answer(text, classification).await?;

        info!(
            id = %record.id,
            answer_id = %answer.id,
            classification = %kind,
            "Answer written"
        );
        Ok(RelayOutcome::Answered { record: answer, kind })
    }

    async fn already_answered(&self, text: &str) -> Result<bool, RelayError> {
        self.dedup
            .already_answered(text)
            .await
            .map_err(RelayError::Dedup)
    }

    /// The single write of an invocation.
    async fn persist_answer(
        &self,
        response_to: &str,
        classification: Classification,
    ) -> Result<MessageRecord, RelayError> {
        self.store
            .insert_message(NewMessage::answer(response_to, classification.into_payload()))
            .await
            .map_err(RelayError::Persist)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use tokio::sync::broadcast;

    use super::*;
    use crate::error::{DatabaseError, GatewayError};
    use crate::gateway::GatewayReply;
    use crate::store::LibSqlBackend;

    /// Gateway stub returning a fixed reply and recording requests.
    struct StubGateway {
        reply: Result<GatewayReply, String>,
        calls: AtomicUsize,
        last_request: Mutex<Option<RelayRequest>>,
    }

    impl StubGateway {
        fn replying(status: u16, body: Option<Value>) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(GatewayReply::new(status, body)),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(reason.to_string()),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnsweringService for StubGateway {
        async fn send(&self, request: &RelayRequest) -> Result<GatewayReply, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            self.reply.clone().map_err(GatewayError::Request)
        }
    }

    /// Writes a competing success answer, then fails the call.
    struct RacingGateway {
        store: Arc<dyn Database>,
    }

    #[async_trait]
    impl AnsweringService for RacingGateway {
        async fn send(&self, request: &RelayRequest) -> Result<GatewayReply, GatewayError> {
            self.store
                .insert_message(NewMessage::answer(&request.message, json!({"answer": 42})))
                .await
                .unwrap();
            Err(GatewayError::Request("connection reset by peer".into()))
        }
    }

    /// Wraps the in-memory store and fails reads or writes on demand.
    struct FlakyStore {
        inner: LibSqlBackend,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl Database for FlakyStore {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            self.inner.init_schema().await
        }

        async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, DatabaseError> {
            if self.fail_writes {
                return Err(DatabaseError::Query("insert_message: disk I/O error".into()));
            }
            self.inner.insert_message(message).await
        }

        async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
            self.inner.get_message(id).await
        }

        async fn find_answer(&self, text: &str) -> Result<Option<MessageRecord>, DatabaseError> {
            if self.fail_reads {
                return Err(DatabaseError::Query("find_answer: database is locked".into()));
            }
            self.inner.find_answer(text).await
        }

        async fn list_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, DatabaseError> {
            self.inner.list_messages(limit).await
        }

        async fn list_unanswered(
            &self,
            after: Option<&MessageRecord>,
            limit: usize,
        ) -> Result<Vec<MessageRecord>, DatabaseError> {
            self.inner.list_unanswered(after, limit).await
        }

        fn subscribe(&self) -> broadcast::Receiver<MessageRecord> {
            self.inner.subscribe()
        }
    }

    async fn memory_store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn trigger(store: &Arc<dyn Database>, gateway: Arc<dyn AnsweringService>) -> RelayTrigger {
        RelayTrigger::new(&RelayConfig::new("test-jwt"), Arc::clone(store), gateway)
    }

    async fn answers_for(store: &Arc<dyn Database>, text: &str) -> Vec<MessageRecord> {
        store
            .list_messages(1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.sender == Sender::Ai && m.response_to.as_deref() == Some(text))
            .collect()
    }

    async fn user_message(store: &Arc<dyn Database>, text: &str) -> MessageRecord {
        store.insert_message(NewMessage::user(text)).await.unwrap()
    }

    fn answered_payload(outcome: RelayOutcome) -> Value {
        match outcome {
            RelayOutcome::Answered { record, .. } => record.message,
            other => panic!("Expected Answered, got {other:?}"),
        }
    }

    // ── Filtering ───────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_record_is_a_no_op() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());

        let outcome = trigger.handle(None).await.unwrap();

        assert_eq!(outcome, RelayOutcome::Skipped(SkipReason::NotUserMessage));
        assert_eq!(gateway.calls(), 0);
        assert!(store.list_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ai_record_is_a_no_op() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());
        let ai = store
            .insert_message(NewMessage::answer("hi", json!({"ok": true})))
            .await
            .unwrap();

        let outcome = trigger.handle(Some(&ai)).await.unwrap();

        assert_eq!(outcome, RelayOutcome::Skipped(SkipReason::NotUserMessage));
        assert_eq!(gateway.calls(), 0);
        assert_eq!(store.list_messages(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_or_structured_user_message_is_a_no_op() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());

        let empty = user_message(&store, "").await;
        let structured = MessageRecord {
            id: "odd".into(),
            sender: Sender::User,
            message: json!({"text": "hi"}),
            response_to: None,
            timestamp: Utc::now(),
        };

        for record in [&empty, &structured] {
            let outcome = trigger.handle(Some(record)).await.unwrap();
            assert_eq!(outcome, RelayOutcome::Skipped(SkipReason::EmptyMessage));
        }
        assert_eq!(gateway.calls(), 0);
        assert_eq!(store.list_messages(10).await.unwrap().len(), 1);
    }

    // ── Dedup ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn existing_answer_skips_call() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());
        store
            .insert_message(NewMessage::answer("hello", json!({"earlier": true})))
            .await
            .unwrap();
        let msg = user_message(&store, "hello").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(outcome, RelayOutcome::Skipped(SkipReason::AlreadyAnswered));
        assert_eq!(gateway.calls(), 0);
        assert_eq!(answers_for(&store, "hello").await.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_answers_once() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"amount_due": 10})));
        let trigger = trigger(&store, gateway.clone());
        let msg = user_message(&store, "my bill").await;

        let first = trigger.handle(Some(&msg)).await.unwrap();
        let second = trigger.handle(Some(&msg)).await.unwrap();

        assert!(matches!(first, RelayOutcome::Answered { .. }));
        assert_eq!(second, RelayOutcome::Skipped(SkipReason::AlreadyAnswered));
        assert_eq!(gateway.calls(), 1);
        assert_eq!(answers_for(&store, "my bill").await.len(), 1);
    }

    #[tokio::test]
    async fn identical_text_from_another_record_counts_as_answered() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());
        let first = user_message(&store, "same words").await;
        let second = user_message(&store, "same words").await;

        trigger.handle(Some(&first)).await.unwrap();
        let outcome = trigger.handle(Some(&second)).await.unwrap();

        assert_eq!(outcome, RelayOutcome::Skipped(SkipReason::AlreadyAnswered));
        assert_eq!(gateway.calls(), 1);
    }

    // ── Classification ──────────────────────────────────────────────

    #[tokio::test]
    async fn success_body_is_persisted_verbatim() {
        let store = memory_store().await;
        let body = json!({"amount_due": 50, "due_date": "2025-01-01", "month": "Jan"});
        let gateway = StubGateway::replying(200, Some(body.clone()));
        let trigger = trigger(&store, gateway.clone());
        let msg = user_message(&store, "calculate my bill").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(answered_payload(outcome), body);
        let request = gateway.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.sender, "test-jwt");
        assert_eq!(request.message, "calculate my bill");
    }

    #[tokio::test]
    async fn explicit_error_takes_precedence_over_status() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(500, Some(json!({"error": "x"})));
        let trigger = trigger(&store, gateway);
        let msg = user_message(&store, "pay my bill").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(answered_payload(outcome), json!({"error": "x"}));
    }

    #[tokio::test]
    async fn http_error_without_error_field() {
        let store = memory_store().await;
        let gateway = StubGateway::replying(404, Some(json!({})));
        let trigger = trigger(&store, gateway);
        let msg = user_message(&store, "bill details").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(
            answered_payload(outcome),
            json!({
                "error": "API Error: Gateway returned status 404",
                "details": "{}",
            })
        );
    }

    #[tokio::test]
    async fn transport_failure_writes_error_record() {
        let store = memory_store().await;
        let gateway = StubGateway::failing("connection refused");
        let trigger = trigger(&store, gateway.clone());
        let msg = user_message(&store, "anyone there?").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(
            answered_payload(outcome),
            json!({"error": "API Call Error", "details": "connection refused"})
        );
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn transport_failure_after_concurrent_answer_writes_nothing() {
        let store = memory_store().await;
        let gateway = Arc::new(RacingGateway {
            store: Arc::clone(&store),
        });
        let trigger = trigger(&store, gateway);
        let msg = user_message(&store, "race me").await;

        let outcome = trigger.handle(Some(&msg)).await.unwrap();

        assert_eq!(outcome, RelayOutcome::DuplicateSuppressed);
        let answers = answers_for(&store, "race me").await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message, json!({"answer": 42}));
    }

    #[tokio::test]
    async fn every_outcome_writes_exactly_one_linked_record() {
        let cases: Vec<(ClassificationKind, Arc<StubGateway>)> = vec![
            (
                ClassificationKind::Success,
                StubGateway::replying(200, Some(json!({"ok": 1}))),
            ),
            (
                ClassificationKind::ExplicitError,
                StubGateway::replying(400, Some(json!({"error": "bad"}))),
            ),
            (ClassificationKind::HttpError, StubGateway::replying(503, None)),
            (ClassificationKind::TransportFailure, StubGateway::failing("dns error")),
        ];

        for (expected, gateway) in cases {
            let store = memory_store().await;
            let trigger = trigger(&store, gateway);
            let msg = user_message(&store, "round trip").await;

            let outcome = trigger.handle(Some(&msg)).await.unwrap();

            match outcome {
                RelayOutcome::Answered { record, kind } => {
                    assert_eq!(kind, expected);
                    assert_eq!(record.sender, Sender::Ai);
                    assert_eq!(record.response_to.as_deref(), Some("round trip"));
                }
                other => panic!("Expected Answered for {expected}, got {other:?}"),
            }
            assert_eq!(answers_for(&store, "round trip").await.len(), 1, "{expected}");
        }
    }

    /// Holds every call for a while before answering.
    struct SlowGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnsweringService for SlowGateway {
        async fn send(&self, request: &RelayRequest) -> Result<GatewayReply, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(GatewayReply::new(200, Some(json!({"echo": request.message}))))
        }
    }

    #[tokio::test]
    async fn concurrent_invocations_for_same_text_call_once() {
        let store = memory_store().await;
        let gateway = Arc::new(SlowGateway {
            calls: AtomicUsize::new(0),
        });
        let trigger = trigger(&store, gateway.clone());
        let first = user_message(&store, "twice at once").await;
        let second = user_message(&store, "twice at once").await;

        let (a, b) = tokio::join!(
            trigger.handle(Some(&first)),
            trigger.handle(Some(&second))
        );
        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, RelayOutcome::Skipped(_)));

        assert!(matches!(outcomes[0], RelayOutcome::Answered { .. }));
        assert_eq!(outcomes[1], RelayOutcome::Skipped(SkipReason::InFlight));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
        assert_eq!(answers_for(&store, "twice at once").await.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_released_after_invocation() {
        let store = memory_store().await;
        let gateway = StubGateway::failing("connection reset");
        let trigger = trigger(&store, gateway.clone());
        let msg = user_message(&store, "retry me").await;

        trigger.handle(Some(&msg)).await.unwrap();
        assert!(trigger.claim("retry me").is_some());

        // Answered with an error record, so a redelivery is a dedup hit.
        let again = trigger.handle(Some(&msg)).await.unwrap();
        assert_eq!(again, RelayOutcome::Skipped(SkipReason::AlreadyAnswered));
    }

    #[tokio::test]
    async fn distinct_texts_run_concurrently() {
        let store = memory_store().await;
        let gateway = Arc::new(SlowGateway {
            calls: AtomicUsize::new(0),
        });
        let trigger = trigger(&store, gateway.clone());
        let first = user_message(&store, "one").await;
        let second = user_message(&store, "two").await;

        let (a, b) = tokio::join!(
            trigger.handle(Some(&first)),
            trigger.handle(Some(&second))
        );

        assert!(matches!(a.unwrap(), RelayOutcome::Answered { .. }));
        assert!(matches!(b.unwrap(), RelayOutcome::Answered { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    // ── Store failures ──────────────────────────────────────────────

    #[tokio::test]
    async fn dedup_read_failure_propagates() {
        let store: Arc<dyn Database> = Arc::new(FlakyStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_reads: true,
            fail_writes: false,
        });
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());
        let msg = user_message(&store, "hello").await;

        let err = trigger.handle(Some(&msg)).await.unwrap_err();

        assert!(matches!(err, RelayError::Dedup(_)));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn write_failure_propagates() {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        let msg = inner.insert_message(NewMessage::user("hello")).await.unwrap();
        let store: Arc<dyn Database> = Arc::new(FlakyStore {
            inner,
            fail_reads: false,
            fail_writes: true,
        });
        let gateway = StubGateway::replying(200, Some(json!({"ok": true})));
        let trigger = trigger(&store, gateway.clone());

        let err = trigger.handle(Some(&msg)).await.unwrap_err();

        assert!(matches!(err, RelayError::Persist(_)));
        assert_eq!(gateway.calls(), 1);
    }
}
