//! Answering-service integration.
//!
//! The relay talks to the remote service through the [`AnsweringService`]
//! trait. A call either completes with some HTTP status and body, or fails at
//! the transport level; status codes never turn into errors here.

pub mod http;

pub use http::HttpGateway;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayError;

/// Outbound request body: `{ "sender": <credential>, "message": <text> }`.
#[derive(Clone, Serialize)]
pub struct RelayRequest {
    /// Opaque credential, forwarded as-is.
    pub sender: String,
    pub message: String,
}

impl fmt::Debug for RelayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRequest")
            .field("sender", &"[REDACTED]")
            .field("message", &self.message)
            .finish()
    }
}

/// A completed call: any status code, with the decoded body if there was one.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReply {
    pub status: u16,
    /// JSON body, a JSON string for non-JSON text, `None` when empty.
    pub body: Option<Value>,
}

impl GatewayReply {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    /// Decode a raw response body.
    pub fn decode_body(bytes: &[u8]) -> Option<Value> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        }
    }
}

/// The remote endpoint that produces answers.
#[async_trait]
pub trait AnsweringService: Send + Sync {
    /// Perform exactly one call. Every HTTP status is `Ok`.
    async fn send(&self, request: &RelayRequest) -> Result<GatewayReply, GatewayError>;
}
