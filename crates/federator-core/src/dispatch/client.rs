//! Synchronous message posts to collaborator services

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::transport::Transport;
use crate::error::{Error, upstream_status_for};
use crate::message::Envelope;
use crate::normalize::normalize_reply;

/// Posts a message to a service that answers with a message of the same shape
#[derive(Clone)]
pub struct ServiceClient {
    transport: Arc<dyn Transport>,
}

impl ServiceClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// POST `envelope` to `url` and normalize whatever comes back.
    ///
    /// Never fails: transport errors become a status code plus an error log
    /// entry on the returned envelope.
    pub async fn post_message(
        &self,
        service: &str,
        url: &str,
        envelope: &Envelope,
        job_id: &str,
        timeout: Duration,
    ) -> (Envelope, u16) {
        debug!(job_id = %job_id, service = %service, url = %url, "Calling service");

        let mut outgoing = envelope.clone();
        outgoing.workflow = None;

        let (status, body) = match serde_json::to_value(&outgoing) {
            Ok(body) => match self.transport.post_json(url, &body, timeout).await {
                Ok(reply) => (reply.status, reply.body),
                Err(e) => {
                    error!(job_id = %job_id, service = %service, error = %e, "Exception posting to service");
                    let status = match &e {
                        Error::NetworkError(inner) => upstream_status_for(inner),
                        _ => 500,
                    };
                    (status, None)
                }
            },
            Err(e) => {
                error!(job_id = %job_id, service = %service, error = %e, "Failed to serialize message");
                (500, None)
            }
        };

        debug!(job_id = %job_id, service = %service, status, "Service returned");
        normalize_reply(service, job_id, envelope, status, body)
    }
}
