//! Annotation and normalization collaborators
//!
//! Each call posts the in-flight message and normalizes the reply, so a
//! failing collaborator shows up as a status code and a log entry rather
//! than an error.

use serde_json::{Value, json};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

use crate::config::{ServicesConfig, join_url};
use crate::dispatch::ServiceClient;
use crate::message::{Envelope, LogLevel, Message};

pub struct Services {
    client: ServiceClient,
    config: ServicesConfig,
}

impl Services {
    pub fn new(client: ServiceClient, config: ServicesConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ServicesConfig {
        &self.config
    }

    /// Literature co-occurrence overlay.
    ///
    /// Optional enrichment: the status is always 200; a failure only leaves
    /// its log entry behind.
    pub async fn omnicorp(&self, envelope: &Envelope, job_id: &str) -> (Envelope, u16) {
        let url = join_url(&self.config.ranker_url, "omnicorp_overlay");
        let (reply, status) = self
            .client
            .post_message("omnicorp", &url, envelope, job_id, self.config.timeout())
            .await;
        if status != 200 {
            warn!(job_id = %job_id, status, "Overlay failed, continuing without it");
        }
        (reply, 200)
    }

    pub async fn score(&self, envelope: &Envelope, job_id: &str) -> (Envelope, u16) {
        let url = join_url(&self.config.ranker_url, "score");
        self.client
            .post_message("score", &url, envelope, job_id, self.config.timeout())
            .await
    }

    /// Answer coalescence, skipped when the message is already larger than
    /// `max_input_size` results
    pub async fn answer_coalesce(
        &self,
        envelope: &Envelope,
        max_input_size: Option<usize>,
        job_id: &str,
    ) -> (Envelope, u16) {
        if let Some(limit) = max_input_size
            && envelope.result_count() > limit
        {
            info!(job_id = %job_id, results = envelope.result_count(), limit, "Skipping answer coalesce");
            return (envelope.clone(), 200);
        }
        let url = join_url(&self.config.coalesce_url, &self.config.coalesce_method);
        self.client
            .post_message("answer_coalesce", &url, envelope, job_id, self.config.timeout())
            .await
    }

    /// Forward a three-hop inferred query to the pathfinder collaborator
    pub async fn pathfinder(&self, envelope: &Envelope, job_id: &str) -> (Envelope, u16) {
        let Some(url) = self.config.pathfinder_url.as_deref() else {
            let msg = "pathfinder No pathfinder service configured.";
            error!(job_id = %job_id, "{}", msg);
            let mut reply = Envelope {
                message: Message::minimal(envelope.message.query_graph.clone()),
                ..Default::default()
            };
            reply.push_log(LogLevel::Error, msg);
            return (reply, 501);
        };
        self.client
            .post_message("pathfinder", url, envelope, job_id, self.config.timeout())
            .await
    }

    /// Replace pinned query-node ids by their preferred identifiers.
    ///
    /// Ids the normalizer does not know are kept. Any failure leaves the
    /// query untouched.
    pub async fn normalize_qgraph_ids(&self, envelope: &mut Envelope, job_id: &str) {
        let Some(qg) = envelope.message.query_graph.as_mut() else {
            return;
        };
        let curies: BTreeSet<&String> = qg
            .nodes
            .values()
            .filter_map(|n| n.ids.as_ref())
            .flatten()
            .collect();
        if curies.is_empty() {
            return;
        }

        let url = join_url(&self.config.nodenorm_url, "get_normalized_nodes");
        let body = json!({
            "curies": curies,
            "conflate": true,
            "drug_chemical_conflate": true,
        });

        let normalized = match self
            .client
            .transport()
            .post_json(&url, &body, self.config.nodenorm_timeout())
            .await
        {
            Ok(reply) if reply.is_success() => reply.body.unwrap_or(Value::Null),
            Ok(reply) => {
                error!(job_id = %job_id, status = reply.status, "Error reaching node normalizer");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Error reaching node normalizer");
                return;
            }
        };

        for node in qg.nodes.values_mut() {
            if let Some(ids) = node.ids.as_mut() {
                for id in ids.iter_mut() {
                    if let Some(preferred) = normalized
                        .get(id.as_str())
                        .and_then(|n| n.pointer("/id/identifier"))
                        .and_then(Value::as_str)
                        && preferred != id.as_str()
                    {
                        debug!(job_id = %job_id, from = %id, to = %preferred, "Normalized query id");
                        *id = preferred.to_string();
                    }
                }
            }
        }
    }
}
