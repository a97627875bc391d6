//! The operations a workflow can name

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info};

use super::lookup::LookupStep;
use super::{Operation, StepContext};
use crate::error::{Error, Result};
use crate::filters::{
    DEFAULT_MAX_RESULTS, message_top_n, prune_orphans, sort_by_score, truncate_results,
};
use crate::merge::merge_results_by_node;
use crate::message::{Envelope, LogLevel};
use crate::services::Services;

fn usize_param(op: &str, params: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                Error::InvalidParameters(op.to_string(), format!("{} must be a non-negative integer", key))
            }),
    }
}

/// `ascending_or_descending`, descending unless told otherwise
fn descending(op: &str, params: &Map<String, Value>) -> Result<bool> {
    match params.get("ascending_or_descending").and_then(Value::as_str) {
        None => match params.get("ascending_or_descending") {
            None | Some(Value::Null) => Ok(true),
            Some(_) => Err(Error::InvalidParameters(
                op.to_string(),
                "ascending_or_descending must be a string".to_string(),
            )),
        },
        Some("descending") => Ok(true),
        Some("ascending") => Ok(false),
        Some(other) => Err(Error::InvalidParameters(
            op.to_string(),
            format!("ascending_or_descending must be 'ascending' or 'descending', not '{}'", other),
        )),
    }
}

pub struct Lookup {
    step: Arc<LookupStep>,
}

impl Lookup {
    pub fn new(step: Arc<LookupStep>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Operation for Lookup {
    fn id(&self) -> &'static str {
        "lookup"
    }

    async fn run(
        &self,
        envelope: Envelope,
        _params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        self.step.run(envelope, ctx).await
    }
}

pub struct EnrichResults {
    services: Arc<Services>,
}

impl EnrichResults {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Operation for EnrichResults {
    fn id(&self) -> &'static str {
        "enrich_results"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        usize_param(self.id(), params, "max_input_size").map(|_| ())
    }

    async fn run(
        &self,
        envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let limit = usize_param(self.id(), params, "max_input_size").unwrap_or(None);
        self.services.answer_coalesce(&envelope, limit, ctx.job_id).await
    }
}

pub struct OverlayConnectKnodes {
    services: Arc<Services>,
}

impl OverlayConnectKnodes {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Operation for OverlayConnectKnodes {
    fn id(&self) -> &'static str {
        "overlay_connect_knodes"
    }

    async fn run(
        &self,
        envelope: Envelope,
        _params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        self.services.omnicorp(&envelope, ctx.job_id).await
    }
}

pub struct Score {
    services: Arc<Services>,
}

impl Score {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Operation for Score {
    fn id(&self) -> &'static str {
        "score"
    }

    async fn run(
        &self,
        envelope: Envelope,
        _params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        self.services.score(&envelope, ctx.job_id).await
    }
}

pub struct SortResultsScore;

#[async_trait]
impl Operation for SortResultsScore {
    fn id(&self) -> &'static str {
        "sort_results_score"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        descending(self.id(), params).map(|_| ())
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let descending = descending(self.id(), params).unwrap_or(true);
        sort_by_score(&mut envelope.message, descending);
        info!(job_id = %ctx.job_id, descending, "Sorted results");
        (envelope, 200)
    }
}

pub struct FilterResultsTopN;

#[async_trait]
impl Operation for FilterResultsTopN {
    fn id(&self) -> &'static str {
        "filter_results_top_n"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        usize_param(self.id(), params, "max_results").map(|_| ())
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let n = usize_param(self.id(), params, "max_results")
            .unwrap_or(None)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        truncate_results(&mut envelope.message, n);
        info!(job_id = %ctx.job_id, max_results = n, "Filtered results");
        (envelope, 200)
    }
}

pub struct FilterKgraphOrphans;

#[async_trait]
impl Operation for FilterKgraphOrphans {
    fn id(&self) -> &'static str {
        "filter_kgraph_orphans"
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        _params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        prune_orphans(&mut envelope.message);
        info!(job_id = %ctx.job_id, "Filtered knowledge graph");
        (envelope, 200)
    }
}

/// Sort, then truncate and prune only if there are too many results
pub struct FilterMessageTopN;

#[async_trait]
impl Operation for FilterMessageTopN {
    fn id(&self) -> &'static str {
        "filter_message_top_n"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        usize_param(self.id(), params, "max_results")?;
        descending(self.id(), params).map(|_| ())
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let n = usize_param(self.id(), params, "max_results")
            .unwrap_or(None)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let descending = descending(self.id(), params).unwrap_or(true);
        if message_top_n(&mut envelope.message, n, descending) {
            info!(job_id = %ctx.job_id, max_results = n, "Returning filtered message");
        } else {
            info!(job_id = %ctx.job_id, "No filtering needed");
        }
        (envelope, 200)
    }
}

pub struct MergeResultsByQnode {
    resource_id: String,
}

impl MergeResultsByQnode {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
        }
    }
}

#[async_trait]
impl Operation for MergeResultsByQnode {
    fn id(&self) -> &'static str {
        "merge_results_by_qnode"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        match params.get("merge_qnode") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(Error::InvalidParameters(
                self.id().to_string(),
                "merge_qnode is required".to_string(),
            )),
        }
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16) {
        let Some(qnode) = params.get("merge_qnode").and_then(Value::as_str) else {
            return (envelope, 422);
        };
        match merge_results_by_node(&mut envelope.message, qnode, Vec::new(), &self.resource_id) {
            Ok(()) => (envelope, 200),
            Err(e) => {
                error!(job_id = %ctx.job_id, error = %e, "Merging by query node failed");
                envelope.push_log(LogLevel::Error, e.to_string());
                (envelope, 500)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryShape;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn scored(scores: &[f64]) -> Envelope {
        let results: Vec<Value> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "node_bindings": {"n0": [{"id": format!("X:{}", i)}]},
                    "analyses": [{"resource_id": "infores:test", "edge_bindings": {"e0": [{"id": format!("k{}", i)}]}, "score": s}]
                })
            })
            .collect();
        let kg_nodes: Map<String, Value> = (0..scores.len())
            .map(|i| (format!("X:{}", i), json!({"categories": []})))
            .collect();
        let kg_edges: Map<String, Value> = (0..scores.len())
            .map(|i| (format!("k{}", i), json!({"subject": format!("X:{}", i), "object": format!("X:{}", i), "predicate": "biolink:related_to"})))
            .collect();
        serde_json::from_value(json!({"message": {
            "knowledge_graph": {"nodes": kg_nodes, "edges": kg_edges},
            "results": results
        }}))
        .unwrap()
    }

    fn ctx(shape: &QueryShape) -> StepContext<'_> {
        StepContext {
            job_id: "job",
            shape,
            bypass_cache: false,
        }
    }

    #[tokio::test]
    async fn test_sort_ascending() {
        let shape = QueryShape::Lookup;
        let (env, status) = SortResultsScore
            .run(scored(&[0.5, 0.1, 0.9]), &params(json!({"ascending_or_descending": "ascending"})), &ctx(&shape))
            .await;
        assert_eq!(status, 200);
        let scores: Vec<f64> = env.message.results().iter().map(|r| r.best_score()).collect();
        assert_eq!(scores, vec![0.1, 0.5, 0.9]);
    }

    #[tokio::test]
    async fn test_message_top_n_prunes_only_when_cutting() {
        let shape = QueryShape::Lookup;
        let (env, _) = FilterMessageTopN
            .run(scored(&[0.5, 0.1, 0.9]), &params(json!({"max_results": 2})), &ctx(&shape))
            .await;
        assert_eq!(env.result_count(), 2);
        assert_eq!(env.message.results()[0].best_score(), 0.9);
        let kg = env.message.knowledge_graph.unwrap();
        assert_eq!(kg.edges.len(), 2);
        assert!(!kg.edges.contains_key("k1"));

        let (env, _) = FilterMessageTopN
            .run(scored(&[0.5, 0.1]), &params(json!({"max_results": 5})), &ctx(&shape))
            .await;
        assert_eq!(env.message.knowledge_graph.unwrap().edges.len(), 2);
    }

    #[tokio::test]
    async fn test_results_top_n_default() {
        let shape = QueryShape::Lookup;
        let (env, _) = FilterResultsTopN
            .run(scored(&[0.1, 0.2]), &Map::new(), &ctx(&shape))
            .await;
        assert_eq!(env.result_count(), 2);
    }

    #[test]
    fn test_parameter_validation() {
        assert!(FilterResultsTopN.validate(&params(json!({"max_results": "ten"}))).is_err());
        assert!(FilterResultsTopN.validate(&params(json!({"max_results": 10}))).is_ok());
        assert!(SortResultsScore.validate(&params(json!({"ascending_or_descending": "up"}))).is_err());
        assert!(MergeResultsByQnode::new("infores:federator").validate(&Map::new()).is_err());
        assert!(
            MergeResultsByQnode::new("infores:federator")
                .validate(&params(json!({"merge_qnode": "n0"})))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_merge_results_by_qnode_groups() {
        let shape = QueryShape::Lookup;
        let mut env = scored(&[0.1, 0.2]);
        for result in env.message.results_mut() {
            result.node_bindings.get_mut("n0").unwrap()[0].id = "X:0".to_string();
        }
        env.message.query_graph = Some(
            serde_json::from_value(json!({
                "nodes": {"n0": {}, "p": {"ids": ["P:1"]}},
                "edges": {"e0": {"subject": "p", "object": "n0", "predicates": ["biolink:treats"]}}
            }))
            .unwrap(),
        );
        let (env, status) = MergeResultsByQnode::new("infores:federator")
            .run(env, &params(json!({"merge_qnode": "n0"})), &ctx(&shape))
            .await;
        assert_eq!(status, 200);
        assert_eq!(env.result_count(), 1);
        assert_eq!(env.message.auxiliary_graphs.as_ref().unwrap().len(), 2);
    }
}
