//! `/api/messages` handlers.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use super::AppState;
use crate::error::DatabaseError;
use crate::store::{NewMessage, Sender};

pub const DEFAULT_LIST_LIMIT: usize = 200;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_failure(op: &str, e: DatabaseError) -> Response {
    error!(op, error = %e, "Store operation failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Create ──────────────────────────────────────────────────────────────

pub async fn create_message(
    State(state): State<AppState>,
    body: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Response {
    let text = match body {
        Ok(Json(CreateMessageRequest {
            message: Some(text),
        })) if !text.trim().is_empty() => text,
        _ => return error_response(StatusCode::BAD_REQUEST, "Missing 'message' field"),
    };

    match state.store.insert_message(NewMessage::user(text)).await {
        Ok(record) => {
            debug!(id = %record.id, "User message stored");
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => store_failure("create_message", e),
    }
}

// ── List ────────────────────────────────────────────────────────────────

pub async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);

    match state.store.list_messages(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_failure("list_messages", e),
    }
}

// ── Answer lookup ───────────────────────────────────────────────────────

pub async fn get_answer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = match state.store.get_message(&id).await {
        Ok(Some(record)) if record.sender == Sender::User => record,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "Message not found"),
        Err(e) => return store_failure("get_message", e),
    };
    let Some(text) = record.text() else {
        return error_response(StatusCode::NOT_FOUND, "Message has no answer");
    };

    match state.store.find_answer(text).await {
        Ok(Some(answer)) => Json(answer).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Answer not ready"),
        Err(e) => store_failure("find_answer", e),
    }
}
