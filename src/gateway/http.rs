//! reqwest-backed answering-service client.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AnsweringService, GatewayReply, RelayRequest};
use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// POSTs relay requests to a fixed gateway URL.
pub struct HttpGateway {
    url: String,
    timeout: Option<Duration>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            url: config.url.clone(),
            timeout: config.timeout,
            client,
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> GatewayError {
        match self.timeout {
            Some(timeout) if err.is_timeout() => GatewayError::Timeout(timeout),
            _ => GatewayError::Request(error_chain(&err)),
        }
    }
}

/// `err` followed by each of its sources, joined with `": "`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        // Some layers repeat their source's text verbatim.
        if !message.ends_with(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

#[async_trait]
impl AnsweringService for HttpGateway {
    async fn send(&self, request: &RelayRequest) -> Result<GatewayReply, GatewayError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| match self.timeout {
            Some(timeout) if e.is_timeout() => GatewayError::Timeout(timeout),
            _ => GatewayError::Body(error_chain(&e)),
        })?;

        debug!(status, bytes = bytes.len(), "Gateway call completed");
        Ok(GatewayReply::new(status, GatewayReply::decode_body(&bytes)))
    }
}
