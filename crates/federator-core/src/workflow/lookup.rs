//! The `lookup` step: getting raw evidence for a query of any shape

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::StepContext;
use crate::config::{AggregatorProvenance, RetrievalMode};
use crate::dispatch::{Dispatcher, RoundStatus, ServiceClient, Submission};
use crate::filters::{filter_promiscuous_results, filter_repeated_nodes, prune_orphans};
use crate::merge::combine_messages;
use crate::message::{Envelope, LogLevel, Message, RetrievalSource};
use crate::normalize::normalize_reply;
use crate::query::{CreativeQuery, QueryShape, RuleLibrary, expand};
use crate::services::Services;

const RETRIEVAL: &str = "strider";

pub struct LookupStep {
    dispatcher: Dispatcher,
    client: ServiceClient,
    services: Arc<Services>,
    rules: Arc<RuleLibrary>,
    resource_id: String,
    promiscuity_ceiling: usize,
}

impl LookupStep {
    pub fn new(
        dispatcher: Dispatcher,
        client: ServiceClient,
        services: Arc<Services>,
        rules: Arc<RuleLibrary>,
        resource_id: impl Into<String>,
        promiscuity_ceiling: usize,
    ) -> Self {
        Self {
            dispatcher,
            client,
            services,
            rules,
            resource_id: resource_id.into(),
            promiscuity_ceiling,
        }
    }

    pub async fn run(&self, mut envelope: Envelope, ctx: &StepContext<'_>) -> (Envelope, u16) {
        self.services
            .normalize_qgraph_ids(&mut envelope, ctx.job_id)
            .await;

        match ctx.shape {
            QueryShape::Pathfinder => self.services.pathfinder(&envelope, ctx.job_id).await,
            QueryShape::Lookup => self.plain_lookup(envelope, ctx).await,
            QueryShape::Creative(creative) => self.creative_lookup(envelope, creative, ctx).await,
        }
    }

    /// Per-request round deadline: `timeout_seconds` when the caller set one
    fn round_timeout(&self, envelope: &Envelope) -> Duration {
        let config = self.dispatcher.config();
        envelope
            .timeout_seconds(config.round_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.round_timeout())
    }

    async fn plain_lookup(&self, envelope: Envelope, ctx: &StepContext<'_>) -> (Envelope, u16) {
        let config = self.dispatcher.config();
        match config.mode {
            RetrievalMode::Batched => {
                let url = config.endpoint("asyncquery");
                let round = self
                    .dispatcher
                    .post_with_callback(
                        &url,
                        Submission::Single(envelope.clone()),
                        ctx.job_id,
                        self.round_timeout(&envelope),
                        ctx.bypass_cache,
                    )
                    .await;

                match round.replies.into_iter().next() {
                    Some(reply) => {
                        normalize_reply(RETRIEVAL, ctx.job_id, &envelope, 200, Some(reply))
                    }
                    None => {
                        let status = match round.status {
                            RoundStatus::TimedOut => 504,
                            other => match other.http_status() {
                                200 => 500,
                                s => s,
                            },
                        };
                        normalize_reply(RETRIEVAL, ctx.job_id, &envelope, status, None)
                    }
                }
            }
            RetrievalMode::Direct => {
                let url = config.endpoint("query");
                let (mut reply, status) = self
                    .client
                    .post_message(RETRIEVAL, &url, &envelope, ctx.job_id, config.sync_timeout())
                    .await;
                if let Some(aggregator) = &config.aggregator {
                    add_aggregator_provenance(&mut reply.message, aggregator);
                }
                (reply, status)
            }
        }
    }

    async fn creative_lookup(
        &self,
        mut envelope: Envelope,
        creative: &CreativeQuery,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let job_id = ctx.job_id;
        let config = self.dispatcher.config();

        let mut queries = match expand(&envelope, creative, &self.rules) {
            Ok(queries) => queries,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not expand creative query");
                envelope.message = Message::minimal(envelope.message.query_graph.take());
                envelope.push_log(LogLevel::Error, e.to_string());
                return (envelope, e.http_status());
            }
        };
        let Some(lookup_qg) = queries.first().and_then(|q| q.message.query_graph.clone()) else {
            return (envelope, 500);
        };
        if queries.len() > config.max_queries {
            info!(job_id = %job_id, expanded = queries.len(), cap = config.max_queries, "Capping sub-queries");
            queries.truncate(config.max_queries);
        }
        let dispatched = queries.len();

        let replies = match config.mode {
            RetrievalMode::Batched => self.run_batched(queries, &envelope, ctx).await,
            RetrievalMode::Direct => self.run_direct(queries, ctx).await,
        };
        info!(job_id = %job_id, dispatched, usable = replies.len(), "Retrieval complete");

        let original_qg = match envelope.message.query_graph.clone() {
            Some(qg) => qg,
            None => return (envelope, 500),
        };
        match combine_messages(
            &creative.answer_node,
            &original_qg,
            &lookup_qg,
            replies,
            &self.resource_id,
        ) {
            Ok(mut merged) => {
                prune_orphans(&mut merged);
                info!(job_id = %job_id, results = merged.results().len(), "Results merged");
                envelope.message = merged;
                (envelope, 200)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Merging failed");
                envelope.push_log(LogLevel::Error, format!("Merging failed: {}", e));
                (envelope, 500)
            }
        }
    }

    async fn run_batched(
        &self,
        queries: Vec<Envelope>,
        envelope: &Envelope,
        ctx: &StepContext<'_>,
    ) -> Vec<Envelope> {
        let rounds = self
            .dispatcher
            .dispatch_batched(queries, ctx.job_id, self.round_timeout(envelope), ctx.bypass_cache)
            .await;

        let blank = Envelope::default();
        let mut replies = Vec::new();
        for round in rounds {
            if round.status != RoundStatus::Complete {
                warn!(
                    job_id = %ctx.job_id,
                    correlation_id = %round.correlation_id,
                    status = ?round.status,
                    received = round.replies.len(),
                    "Round ended early"
                );
            }
            for raw in round.replies {
                let (reply, status) =
                    normalize_reply(RETRIEVAL, ctx.job_id, &blank, 200, Some(raw));
                if let Some(reply) = self.usable(reply, status, ctx.job_id) {
                    replies.push(reply);
                }
            }
        }
        replies
    }

    async fn run_direct(&self, queries: Vec<Envelope>, ctx: &StepContext<'_>) -> Vec<Envelope> {
        let mut replies = Vec::new();
        for (query, outcome) in self.dispatcher.dispatch_direct(queries, ctx.job_id).await {
            match outcome {
                Ok(reply) => {
                    let (reply, status) =
                        normalize_reply(RETRIEVAL, ctx.job_id, &query, reply.status, reply.body);
                    if let Some(reply) = self.usable(reply, status, ctx.job_id) {
                        replies.push(reply);
                    }
                }
                Err(e) => warn!(job_id = %ctx.job_id, error = %e, "Sub-query failed"),
            }
        }
        replies
    }

    /// Keep a reply only if it succeeded, carries a knowledge graph and
    /// results, and is not oversized; then clean it up for merging
    fn usable(&self, mut reply: Envelope, status: u16, job_id: &str) -> Option<Envelope> {
        let message = &mut reply.message;
        if status != 200 || message.knowledge_graph.is_none() || message.results.is_none() {
            debug!(job_id = %job_id, status, "Skipping reply without results");
            return None;
        }
        let count = message.results().len();
        if count > self.dispatcher.config().max_reply_results {
            warn!(job_id = %job_id, results = count, "Skipping oversized reply");
            return None;
        }

        filter_repeated_nodes(message);
        filter_promiscuous_results(message, self.promiscuity_ceiling);
        Some(reply)
    }
}

/// Append the aggregator to every knowledge edge's sources
fn add_aggregator_provenance(message: &mut Message, aggregator: &AggregatorProvenance) {
    let Some(kg) = message.knowledge_graph.as_mut() else {
        return;
    };
    let mut source = RetrievalSource::new(&aggregator.resource_id, "aggregator_knowledge_source");
    source.upstream_resource_ids = Some(aggregator.upstream_resource_ids.clone());
    for edge in kg.edges.values_mut() {
        edge.sources.push(source.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aggregator_provenance_on_every_edge() {
        let mut message: Message = serde_json::from_value(json!({
            "knowledge_graph": {"nodes": {}, "edges": {
                "k1": {"subject": "A", "object": "B", "predicate": "biolink:treats",
                       "sources": [{"resource_id": "infores:kp", "resource_role": "primary_knowledge_source"}]},
                "k2": {"subject": "B", "object": "C", "predicate": "biolink:affects"}
            }}
        }))
        .unwrap();
        let aggregator = AggregatorProvenance {
            resource_id: "infores:robokop".to_string(),
            upstream_resource_ids: vec!["infores:automat-robokop".to_string()],
        };
        add_aggregator_provenance(&mut message, &aggregator);

        let kg = message.knowledge_graph.unwrap();
        assert_eq!(kg.edges["k1"].sources.len(), 2);
        let added = &kg.edges["k2"].sources[0];
        assert_eq!(added.resource_id, "infores:robokop");
        assert_eq!(added.resource_role, "aggregator_knowledge_source");
        assert_eq!(
            added.upstream_resource_ids,
            Some(vec!["infores:automat-robokop".to_string()])
        );
    }
}
