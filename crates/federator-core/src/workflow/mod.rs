//! Declarative workflow execution
//!
//! A workflow is an ordered list of named steps. Names are resolved against
//! an [`OperationRegistry`] before anything runs, so an unknown operation or
//! malformed parameters reject the request up front. Steps then run strictly
//! in order; the first failure or empty result set ends the run and the
//! partial message is returned as-is.

pub mod lookup;
pub mod operations;

pub use lookup::LookupStep;
pub use operations::{
    EnrichResults, FilterKgraphOrphans, FilterMessageTopN, FilterResultsTopN, Lookup,
    MergeResultsByQnode, OverlayConnectKnodes, Score, SortResultsScore,
};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::jobs::{JobEntry, JobLog};
use crate::message::{Envelope, WorkflowStep};
use crate::query::QueryShape;
use crate::services::Services;

/// Per-request facts every step may need
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub job_id: &'a str,
    pub shape: &'a QueryShape,
    pub bypass_cache: bool,
}

/// One named workflow operation
#[async_trait]
pub trait Operation: Send + Sync {
    /// Identifier used in workflow definitions
    fn id(&self) -> &'static str;

    /// Reject parameters the operation cannot run with
    fn validate(&self, _params: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        envelope: Envelope,
        params: &Map<String, Value>,
        ctx: &StepContext<'_>,
    ) -> (Envelope, u16);
}

/// A resolved workflow step
#[derive(Clone)]
pub struct PlannedStep {
    pub id: String,
    pub operation: Arc<dyn Operation>,
    pub params: Map<String, Value>,
}

impl std::fmt::Debug for PlannedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedStep")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<&'static str, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation the engine advertises
    pub fn standard(lookup: Arc<LookupStep>, services: Arc<Services>, resource_id: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Lookup::new(lookup)));
        registry.register(Arc::new(EnrichResults::new(services.clone())));
        registry.register(Arc::new(OverlayConnectKnodes::new(services.clone())));
        registry.register(Arc::new(Score::new(services)));
        registry.register(Arc::new(SortResultsScore));
        registry.register(Arc::new(FilterResultsTopN));
        registry.register(Arc::new(FilterKgraphOrphans));
        registry.register(Arc::new(FilterMessageTopN));
        registry.register(Arc::new(MergeResultsByQnode::new(resource_id)));
        registry
    }

    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        self.operations.insert(operation.id(), operation);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(id).cloned()
    }

    /// Registered operation ids, sorted
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.operations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve a workflow definition into runnable steps
    pub fn plan(&self, workflow: &[WorkflowStep]) -> Result<Vec<PlannedStep>> {
        workflow
            .iter()
            .map(|step| {
                let operation = self
                    .get(&step.id)
                    .ok_or_else(|| Error::UnknownOperation(step.id.clone()))?;
                let params = step.parameters.clone().unwrap_or_default();
                operation.validate(&params)?;
                Ok(PlannedStep {
                    id: step.id.clone(),
                    operation,
                    params,
                })
            })
            .collect()
    }
}

/// Workflow used when the caller does not supply one
pub fn default_workflow(shape: &QueryShape) -> Vec<WorkflowStep> {
    let max_results = match shape {
        QueryShape::Creative(_) | QueryShape::Pathfinder => 500,
        QueryShape::Lookup => 5000,
    };
    vec![
        WorkflowStep::new("lookup"),
        WorkflowStep::new("overlay_connect_knodes"),
        WorkflowStep::new("score"),
        WorkflowStep::with_parameters("filter_message_top_n", json!({"max_results": max_results})),
    ]
}

/// Run planned steps in order.
///
/// Stops after the first step that fails or leaves no results. Every
/// executed step is recorded in the job log. TRAPI log entries accumulate
/// across steps; the caller's parameters and log level are carried forward
/// when a collaborator's reply drops them.
pub async fn run_workflow(
    mut envelope: Envelope,
    steps: &[PlannedStep],
    ctx: &StepContext<'_>,
    jobs: &dyn JobLog,
) -> (Envelope, u16) {
    let mut logs = std::mem::take(&mut envelope.logs);
    let parameters = envelope.parameters.clone();
    let log_level = envelope.log_level.clone();
    let mut status = 200;

    for step in steps {
        envelope.message.results.get_or_insert_with(Vec::new);
        info!(
            job_id = %ctx.job_id,
            operation = %step.id,
            results = envelope.result_count(),
            "Starting operation"
        );
        record(jobs, ctx.job_id, format!("Starting operation {}", step.id), 200).await;

        let (mut next, code) = step.operation.run(envelope, &step.params, ctx).await;
        logs.append(&mut next.logs);
        if next.parameters.is_none() {
            next.parameters = parameters.clone();
        }
        if next.log_level.is_none() {
            next.log_level = log_level.clone();
        }
        envelope = next;
        status = code;

        if code != 200 || envelope.message.results.is_none() {
            warn!(job_id = %ctx.job_id, operation = %step.id, status = code, "Operation failed");
            record(jobs, ctx.job_id, format!("{} failed", step.id), code).await;
            break;
        }
        let count = envelope.result_count();
        if count == 0 {
            info!(job_id = %ctx.job_id, operation = %step.id, "Operation returned no results");
            record(jobs, ctx.job_id, format!("{} returned 0 results", step.id), 200).await;
            break;
        }
        record(jobs, ctx.job_id, format!("{} succeeded with {}", step.id, count), code).await;
    }

    envelope.logs = logs;
    (envelope, status)
}

/// Job log writes never fail the request
async fn record(jobs: &dyn JobLog, job_id: &str, msg: String, code: u16) {
    if let Err(e) = jobs.append(job_id, JobEntry::new(msg, code)).await {
        warn!(job_id = %job_id, error = %e, "Failed to write job log");
    }
}
