//! Fan-out/fan-in of sub-queries over the callback protocol
//!
//! A round is one POST carrying one query or a named batch of queries. The
//! delivery channel for the round's correlation id is provisioned before the
//! POST and deleted when the round ends, whatever the outcome. Replies are
//! collected until the batch-complete sentinel arrives, the single expected
//! reply arrives, or the round deadline passes. A deadline keeps whatever
//! arrived.

use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::blob::BlobStore;
use super::broker::{CallbackBroker, Delivery};
use super::transport::{Transport, TransportReply};
use crate::config::{RetrievalConfig, join_url};
use crate::error::{Result, upstream_status_for};
use crate::message::Envelope;
use crate::normalize::strip_nulls;

/// How a round ended
#[derive(Debug, Clone, PartialEq)]
pub enum RoundStatus {
    /// Sentinel received, or the single expected reply arrived
    Complete,
    /// Deadline passed; replies hold whatever arrived first
    TimedOut,
    /// The submit POST answered with a non-success status
    Rejected(u16),
    /// The round could not run or was cut short by a broker failure
    Failed(String),
}

impl RoundStatus {
    /// HTTP-style status to record for the round
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Complete | Self::TimedOut => 200,
            Self::Rejected(status) => *status,
            Self::Failed(_) => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Round {
    pub correlation_id: String,
    pub replies: Vec<Value>,
    pub status: RoundStatus,
}

/// Whether a reply is the batch-complete sentinel
pub fn is_end_message(reply: &Value) -> bool {
    reply
        .pointer("/status_communication/strider_multiquery_status")
        .and_then(Value::as_str)
        == Some("complete")
}

/// Consume a provisioned channel until the round is over.
///
/// `idle_timeout` bounds a single wait on an open connection; on expiry the
/// connection is reopened and waiting resumes, never past `round_timeout`.
pub async fn collect_replies(
    broker: &dyn CallbackBroker,
    blobs: &dyn BlobStore,
    correlation_id: &str,
    num_queries: usize,
    round_timeout: Duration,
    idle_timeout: Duration,
) -> (Vec<Value>, RoundStatus) {
    let deadline = Instant::now() + round_timeout;
    let mut replies = Vec::new();
    let mut received = 0usize;

    let mut stream = match broker.open(correlation_id).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "Failed to open delivery channel");
            return (replies, RoundStatus::Failed(e.to_string()));
        }
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            info!(correlation_id = %correlation_id, received, "Timing out receiving callbacks");
            return (replies, RoundStatus::TimedOut);
        }
        let wait = idle_timeout.min(deadline - now);

        let delivery = match timeout(wait, stream.next()).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                warn!(correlation_id = %correlation_id, received, "Delivery channel closed");
                return (replies, RoundStatus::Failed("delivery channel closed".to_string()));
            }
            Err(_) => {
                if Instant::now() >= deadline {
                    continue;
                }
                debug!(correlation_id = %correlation_id, "Cycling delivery connection");
                drop(stream);
                stream = match broker.open(correlation_id).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(correlation_id = %correlation_id, error = %e, received, "Lost delivery channel");
                        return (replies, RoundStatus::Failed(e.to_string()));
                    }
                };
                continue;
            }
        };

        received += 1;
        info!(correlation_id = %correlation_id, received, expected = num_queries, "Callback received");

        let mut reply = match resolve(blobs, delivery).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Dropping unreadable callback");
                continue;
            }
        };

        if is_end_message(&reply) {
            info!(correlation_id = %correlation_id, "Received batch complete message");
            return (replies, RoundStatus::Complete);
        }

        strip_nulls(&mut reply);
        if reply.pointer("/message/query_graph").is_none() {
            warn!(correlation_id = %correlation_id, "No query graph in callback; ignoring");
        } else {
            replies.push(reply);
        }

        if num_queries == 1 {
            return (replies, RoundStatus::Complete);
        }
    }
}

async fn resolve(blobs: &dyn BlobStore, delivery: Delivery) -> Result<Value> {
    match delivery {
        Delivery::Inline(value) => Ok(value),
        Delivery::Stored(key) => {
            let bytes = blobs.take(&key).await?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }
}

/// What a round submits
#[derive(Debug, Clone)]
pub enum Submission {
    Single(Envelope),
    /// Named queries sent as one multi-query body
    Batch(Vec<(String, Envelope)>),
}

impl Submission {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(queries) => queries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_body(self, callback: &str, bypass_cache: bool) -> Result<Value> {
        let prepare = |mut env: Envelope| {
            env.callback = Some(callback.to_string());
            env.bypass_cache = bypass_cache;
            env.workflow = None;
            serde_json::to_value(env)
        };
        Ok(match self {
            Self::Single(env) => prepare(env)?,
            Self::Batch(queries) => {
                let mut body = serde_json::Map::new();
                for (name, env) in queries {
                    body.insert(name, prepare(env)?);
                }
                Value::Object(body)
            }
        })
    }
}

/// Runs sub-queries against the retrieval service
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    broker: Arc<dyn CallbackBroker>,
    blobs: Arc<dyn BlobStore>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_url", &self.config.base_url)
            .field("mode", &self.config.mode)
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        broker: Arc<dyn CallbackBroker>,
        blobs: Arc<dyn BlobStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            transport,
            broker,
            blobs,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn callback_url(&self, correlation_id: &str) -> String {
        join_url(&self.config.callback_host, &format!("callback/{}", correlation_id))
    }

    /// Run one round of the callback protocol
    pub async fn post_with_callback(
        &self,
        url: &str,
        submission: Submission,
        job_id: &str,
        round_timeout: Duration,
        bypass_cache: bool,
    ) -> Round {
        let correlation_id = Uuid::new_v4().to_string();
        let num_queries = submission.len();
        let finish = |replies, status| Round {
            correlation_id: correlation_id.clone(),
            replies,
            status,
        };

        let body = match submission.into_body(&self.callback_url(&correlation_id), bypass_cache) {
            Ok(body) => body,
            Err(e) => return finish(Vec::new(), RoundStatus::Failed(e.to_string())),
        };

        if let Err(e) = self.broker.provision(&correlation_id).await {
            error!(job_id = %job_id, correlation_id = %correlation_id, error = %e, "Failed to create delivery channel");
            return finish(Vec::new(), RoundStatus::Failed(e.to_string()));
        }

        debug!(job_id = %job_id, correlation_id = %correlation_id, url = %url, num_queries, "Submitting round");
        let submitted = self
            .transport
            .post_json(url, &body, self.config.submit_timeout())
            .await;

        let outcome = match submitted {
            Ok(reply) if reply.is_success() => {
                collect_replies(
                    self.broker.as_ref(),
                    self.blobs.as_ref(),
                    &correlation_id,
                    num_queries,
                    round_timeout,
                    self.config.idle_timeout(),
                )
                .await
            }
            Ok(reply) => {
                warn!(job_id = %job_id, status = reply.status, "Submit rejected; deleting unneeded channel");
                (Vec::new(), RoundStatus::Rejected(reply.status))
            }
            Err(e) => {
                error!(job_id = %job_id, url = %url, error = %e, "Failed to contact retrieval service");
                let status = match &e {
                    crate::error::Error::NetworkError(inner) => upstream_status_for(inner),
                    _ => 500,
                };
                (Vec::new(), RoundStatus::Rejected(status))
            }
        };

        if let Err(e) = self.broker.delete(&correlation_id).await {
            error!(job_id = %job_id, correlation_id = %correlation_id, error = %e, "Failed to delete delivery channel");
        }

        finish(outcome.0, outcome.1)
    }

    /// Send queries in rounds of `batch_size` to the multi-query endpoint.
    ///
    /// Queries are named `query_<n>` with `n` counting from 1 across rounds.
    pub async fn dispatch_batched(
        &self,
        queries: Vec<Envelope>,
        job_id: &str,
        round_timeout: Duration,
        bypass_cache: bool,
    ) -> Vec<Round> {
        let url = self.config.endpoint("multiquery");
        let mut rounds = Vec::new();
        let mut numbered = queries
            .into_iter()
            .enumerate()
            .map(|(i, q)| (format!("query_{}", i + 1), q))
            .peekable();

        while numbered.peek().is_some() {
            let batch: Vec<_> = numbered.by_ref().take(self.config.batch_size).collect();
            info!(job_id = %job_id, queries = batch.len(), "Sending batch to retrieval");
            let round = self
                .post_with_callback(
                    &url,
                    Submission::Batch(batch),
                    job_id,
                    round_timeout,
                    bypass_cache,
                )
                .await;
            rounds.push(round);
            info!(job_id = %job_id, returned = rounds.len(), "Batches returned");
        }

        rounds
    }

    /// Post each query synchronously, at most `max_connections` at a time.
    ///
    /// Replies come back in completion order.
    pub async fn dispatch_direct(
        &self,
        queries: Vec<Envelope>,
        job_id: &str,
    ) -> Vec<(Envelope, Result<TransportReply>)> {
        let url = self.config.endpoint("query");
        let timeout = self.config.direct_timeout();
        info!(job_id = %job_id, queries = queries.len(), url = %url, "Sending direct queries");

        stream::iter(queries)
            .map(|query| {
                let url = url.clone();
                async move {
                    let reply = match serde_json::to_value(&query) {
                        Ok(body) => self.transport.post_json(&url, &body, timeout).await,
                        Err(e) => Err(e.into()),
                    };
                    (query, reply)
                }
            })
            .buffer_unordered(self.config.max_connections)
            .collect()
            .await
    }
}

/// Marker reply a multi-query service sends when a batch is finished
pub fn end_message() -> Value {
    json!({"status_communication": {"strider_multiquery_status": "complete"}})
}
