//! Event dispatch — feeds created records into the trigger.
//!
//! Every record the store broadcasts gets its own task. Delivery is
//! at-least-once: a lagging receiver and a fresh start both fall back to
//! [`recover_unanswered`], and the trigger's in-flight claim and dedup make
//! repeats harmless.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::trigger::RelayTrigger;
use crate::error::DatabaseError;
use crate::store::{Database, MessageRecord};

/// Subscribe to store events and relay each one in the background.
///
/// The subscription is taken before this returns, so records created
/// afterwards are never missed. Lag recovery runs on its own task; the
/// receive loop keeps draining events meanwhile.
pub fn spawn_dispatcher(
    trigger: Arc<RelayTrigger>,
    store: Arc<dyn Database>,
    recovery_limit: usize,
) -> JoinHandle<()> {
    let mut events = store.subscribe();
    // One sweep running plus at most one queued behind it.
    let (recovery_tx, recovery_rx) = mpsc::channel::<()>(1);
    tokio::spawn(recovery_worker(
        Arc::clone(&trigger),
        Arc::clone(&store),
        recovery_limit,
        recovery_rx,
    ));

    tokio::spawn(async move {
        info!("Relay dispatcher started");
        loop {
            match events.recv().await {
                Ok(record) => dispatch(Arc::clone(&trigger), record),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Dispatcher fell behind store events; scheduling recovery");
                    // Full means a queued sweep will already cover these records.
                    let _ = recovery_tx.try_send(());
                }
                Err(RecvError::Closed) => {
                    debug!("Store event channel closed");
                    break;
                }
            }
        }
        info!("Relay dispatcher stopped");
    })
}

fn dispatch(trigger: Arc<RelayTrigger>, record: MessageRecord) {
    tokio::spawn(async move {
        if let Err(e) = trigger.handle(Some(&record)).await {
            error!(id = %record.id, error = %e, "Relay invocation failed");
        }
    });
}

/// Runs one recovery sweep per request until the dispatcher goes away.
async fn recovery_worker(
    trigger: Arc<RelayTrigger>,
    store: Arc<dyn Database>,
    page_size: usize,
    mut requests: mpsc::Receiver<()>,
) {
    while requests.recv().await.is_some() {
        match recover_unanswered(&trigger, store.as_ref(), page_size).await {
            Ok(recovered) => info!(recovered, "Recovery after lag finished"),
            Err(e) => error!(error = %e, "Recovery after lag failed"),
        }
    }
}

/// Run one recovery sweep in the background, e.g. at startup.
pub fn spawn_recovery(
    trigger: Arc<RelayTrigger>,
    store: Arc<dyn Database>,
    page_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match recover_unanswered(&trigger, store.as_ref(), page_size).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered unanswered messages from DB"),
            Err(e) => error!(error = %e, "Startup recovery failed"),
        }
    })
}

/// Relay every user message that has no answer yet, oldest first.
///
/// The backlog is read `page_size` records at a time until it is exhausted.
/// Returns how many records were handed to the trigger. Per-record failures
/// are logged and do not stop the sweep.
pub async fn recover_unanswered(
    trigger: &RelayTrigger,
    store: &dyn Database,
    page_size: usize,
) -> Result<usize, DatabaseError> {
    let page_size = page_size.max(1);
    let mut cursor: Option<MessageRecord> = None;
    let mut recovered = 0;

    loop {
        let page = store.list_unanswered(cursor.as_ref(), page_size).await?;
        if page.is_empty() {
            break;
        }
        debug!(count = page.len(), "Recovering unanswered messages");

        let full = page.len() == page_size;
        for record in &page {
            if let Err(e) = trigger.handle(Some(record)).await {
                error!(id = %record.id, error = %e, "Recovery invocation failed");
            }
            recovered += 1;
        }

        match page.into_iter().last() {
            Some(last) if full => cursor = Some(last),
            _ => break,
        }
    }

    Ok(recovered)
}
