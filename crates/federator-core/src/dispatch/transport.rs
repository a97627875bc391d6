//! Outbound HTTP transport

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Status and decoded body of one outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct TransportReply {
    pub status: u16,
    /// `None` when the body was empty or not JSON
    pub body: Option<Value>,
}

impl TransportReply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    pub fn status(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Posts JSON bodies to collaborator services.
///
/// An `Err` means no HTTP status was obtained at all (connect failure,
/// deadline, TLS); any status, including errors, is an `Ok` reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value, timeout: Duration)
    -> Result<TransportReply>;
}

/// Transport backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: HttpClient,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let http_client = HttpClient::builder()
            .user_agent(concat!("federator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::NetworkError)?;
        Ok(Self { http_client })
    }

    pub fn with_client(http_client: HttpClient) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportReply> {
        debug!(url = %url, timeout_secs = timeout.as_secs(), "POST");

        let response = self
            .http_client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        let body = if bytes.is_empty() {
            None
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(url = %url, status, error = %e, "Response body is not JSON");
                    None
                }
            }
        };

        Ok(TransportReply { status, body })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_helpers() {
        assert!(TransportReply::ok(serde_json::json!({})).is_success());
        let failed = TransportReply::status(503);
        assert!(!failed.is_success());
        assert!(failed.body.is_none());
    }

    #[test]
    fn test_reqwest_transport_builds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}
