//! Response classifier — maps a gateway call outcome to one answer shape.
//!
//! Pure functions only; persistence decisions live in the trigger.

use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::gateway::GatewayReply;

/// `details` used when an HTTP error carries no body.
pub const NO_DETAILS_PLACEHOLDER: &str = "No additional error details provided.";

/// `error` text of a transport-failure answer.
pub const TRANSPORT_ERROR_TEXT: &str = "API Call Error";

/// How an outbound call resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Completed, status < 400, no `error` field: body persisted verbatim.
    Success(Value),
    /// Completed with a truthy `error` field, whatever the status.
    ExplicitError(Value),
    /// Completed with status >= 400 and no `error` field.
    HttpError { status: u16, body: Option<Value> },
    /// The call never completed.
    TransportFailure(String),
}

/// Which branch of [`Classification`] an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationKind {
    Success,
    ExplicitError,
    HttpError,
    TransportFailure,
}

impl ClassificationKind {
    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationKind::Success => "success",
            ClassificationKind::ExplicitError => "explicit_error",
            ClassificationKind::HttpError => "http_error",
            ClassificationKind::TransportFailure => "transport_failure",
        }
    }
}

impl std::fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Classification {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            Classification::Success(_) => ClassificationKind::Success,
            Classification::ExplicitError(_) => ClassificationKind::ExplicitError,
            Classification::HttpError { .. } => ClassificationKind::HttpError,
            Classification::TransportFailure(_) => ClassificationKind::TransportFailure,
        }
    }

    /// The `message` payload of the answer record.
    pub fn into_payload(self) -> Value {
        match self {
            Classification::Success(body) => body,
            Classification::ExplicitError(error) => json!({ "error": error }),
            Classification::HttpError { status, body } => {
                let details = match body {
                    Some(body) if is_truthy(&body) => body.to_string(),
                    _ => NO_DETAILS_PLACEHOLDER.to_string(),
                };
                json!({
                    "error": format!("API Error: Gateway returned status {status}"),
                    "details": details,
                })
            }
            Classification::TransportFailure(details) => json!({
                "error": TRANSPORT_ERROR_TEXT,
                "details": details,
            }),
        }
    }
}

/// Classify a completed call. The explicit-error check wins over the status.
pub fn classify_reply(reply: GatewayReply) -> Classification {
    let GatewayReply { status, body } = reply;

    if let Some(error) = body.as_ref().and_then(explicit_error) {
        return Classification::ExplicitError(error.clone());
    }
    if status >= 400 {
        return Classification::HttpError { status, body };
    }
    Classification::Success(body.unwrap_or(Value::Null))
}

/// Classify either outcome of a single call.
pub fn classify(outcome: Result<GatewayReply, GatewayError>) -> Classification {
    match outcome {
        Ok(reply) => classify_reply(reply),
        Err(err) => Classification::TransportFailure(err.to_string()),
    }
}

fn explicit_error(body: &Value) -> Option<&Value> {
    body.as_object()?.get("error").filter(|error| is_truthy(error))
}

/// Script-style truthiness: null, false, zero, NaN-ish and "" are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
