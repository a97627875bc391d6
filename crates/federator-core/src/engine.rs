//! Request execution: classification, cache gating and the workflow run

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheGateway, CacheKey, ResultStore, SqliteResultStore, rewrite_cached_result};
use crate::config::Config;
use crate::dispatch::{
    BlobStore, CallbackBroker, Delivery, Dispatcher, FsBlobStore, LocalBroker, ReqwestTransport,
    ServiceClient, Transport,
};
use crate::error::{Error, Result};
use crate::jobs::{COMPLETE, FAILED, JobEntry, JobLog, JobReport, SqliteJobLog};
use crate::message::{Envelope, LogLevel, WorkflowStep};
use crate::query::{InferredEdge, QueryShape, RuleLibrary, classify, expand};
use crate::services::Services;
use crate::workflow::{LookupStep, OperationRegistry, StepContext, default_workflow, run_workflow};

/// Fresh job identifier
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Assembles a [`Federator`], filling anything not injected from the config
pub struct FederatorBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    broker: Option<Arc<dyn CallbackBroker>>,
    blobs: Option<Arc<dyn BlobStore>>,
    results: Option<Arc<dyn ResultStore>>,
    jobs: Option<Arc<dyn JobLog>>,
    rules: Option<RuleLibrary>,
}

impl FederatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            broker: None,
            blobs: None,
            results: None,
            jobs: None,
            rules: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn CallbackBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn job_log(mut self, jobs: Arc<dyn JobLog>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn rules(mut self, rules: RuleLibrary) -> Self {
        self.rules = Some(rules);
        self
    }

    pub async fn build(self) -> Result<Federator> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let broker: Arc<dyn CallbackBroker> = match self.broker {
            Some(b) => b,
            None => Arc::new(LocalBroker::new()),
        };
        let blobs: Arc<dyn BlobStore> = match self.blobs {
            Some(b) => b,
            None => Arc::new(FsBlobStore::new(config.storage.blob_dir()).await?),
        };
        let cache = match self.results {
            Some(store) => CacheGateway::new(store),
            None if config.storage.cache_enabled => {
                let store = SqliteResultStore::connect(&config.storage.cache_path()).await?;
                CacheGateway::new(Arc::new(store))
            }
            None => CacheGateway::disabled(),
        };
        let jobs: Arc<dyn JobLog> = match self.jobs {
            Some(j) => j,
            None => Arc::new(SqliteJobLog::connect(&config.storage.jobs_path()).await?),
        };
        let rules = match self.rules {
            Some(rules) => rules,
            None => RuleLibrary::load_files(config.engine.rule_files.as_slice())?,
        };
        let rules = Arc::new(rules);

        let client = ServiceClient::new(transport.clone());
        let services = Arc::new(Services::new(client.clone(), config.services.clone()));
        let dispatcher = Dispatcher::new(
            transport,
            broker.clone(),
            blobs.clone(),
            config.retrieval.clone(),
        );
        let lookup = Arc::new(LookupStep::new(
            dispatcher,
            client,
            services.clone(),
            rules.clone(),
            config.engine.resource_id.clone(),
            config.engine.promiscuity_ceiling,
        ));
        let registry = OperationRegistry::standard(lookup, services, &config.engine.resource_id);

        info!(
            rules = rules.rule_count(),
            cache = cache.is_enabled(),
            mode = %config.retrieval.mode,
            "Federator ready"
        );

        Ok(Federator {
            config,
            registry,
            rules,
            cache,
            jobs,
            broker,
            blobs,
        })
    }
}

/// The query orchestrator
pub struct Federator {
    config: Config,
    registry: OperationRegistry,
    rules: Arc<RuleLibrary>,
    cache: CacheGateway,
    jobs: Arc<dyn JobLog>,
    broker: Arc<dyn CallbackBroker>,
    blobs: Arc<dyn BlobStore>,
}

impl Federator {
    pub fn builder(config: Config) -> FederatorBuilder {
        FederatorBuilder::new(config)
    }

    /// Build with every collaborator taken from the config
    pub async fn from_config(config: Config) -> Result<Self> {
        FederatorBuilder::new(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &RuleLibrary {
        &self.rules
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.registry.ids()
    }

    /// Answer one query.
    ///
    /// Validation problems are returned as errors before anything is sent
    /// anywhere. Everything after that produces a response envelope and a
    /// status, degraded if need be.
    pub async fn execute(&self, envelope: Envelope, job_id: &str) -> Result<(Envelope, u16)> {
        match self.run(envelope, job_id).await {
            Ok((answer, status)) => Ok(self.finish(answer, status, job_id).await),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Rejected query");
                self.record(job_id, format!("{}: {}", FAILED, e), e.http_status())
                    .await;
                Err(e)
            }
        }
    }

    async fn run(&self, mut envelope: Envelope, job_id: &str) -> Result<(Envelope, u16)> {
        let shape = classify(envelope.query_graph())?;
        let query_graph = envelope
            .query_graph()
            .cloned()
            .ok_or_else(|| Error::InvalidQuery("No query graph".to_string()))?;
        info!(job_id = %job_id, shape = shape.as_str(), "Classified query");

        let bypass_cache = envelope.bypass_cache;
        let overwrite_cache = envelope.overwrite_cache();

        let workflow = envelope
            .workflow
            .take()
            .unwrap_or_else(|| default_workflow(&shape));
        let plan = self.registry.plan(&workflow)?;

        let key = match &shape {
            QueryShape::Creative(_) => Some(CacheKey::creative(
                &InferredEdge::from_query_graph(&query_graph)?,
                &self.config.engine.caller,
                &workflow,
            )?),
            QueryShape::Lookup => Some(CacheKey::lookup(&workflow, &query_graph)?),
            QueryShape::Pathfinder => None,
        };

        let read_from_cache = !(bypass_cache || overwrite_cache);
        if read_from_cache
            && let Some(key) = &key
            && let Some(cached) = self.cache.get(key).await
        {
            let message = if shape.is_creative() {
                match rewrite_cached_result(cached, &query_graph) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Cached answer does not fit query");
                        None
                    }
                }
            } else {
                Some(cached)
            };
            if let Some(message) = message {
                info!(job_id = %job_id, "Returning results cache lookup");
                envelope.message = message;
                envelope.workflow = Some(workflow);
                envelope.push_log(LogLevel::Info, "Returning cached results.");
                return Ok((envelope, 200));
            }
        } else if read_from_cache && key.is_some() {
            info!(job_id = %job_id, "Results cache miss");
        }

        let ctx = StepContext {
            job_id,
            shape: &shape,
            bypass_cache,
        };
        let (mut answer, status) = run_workflow(envelope, &plan, &ctx, self.jobs.as_ref()).await;
        answer.workflow = Some(workflow.clone());

        if (overwrite_cache || !bypass_cache)
            && status == 200
            && let Some(key) = &key
        {
            let cacheable = shape.is_creative() || has_lookup_step(&workflow);
            if cacheable {
                debug!(job_id = %job_id, namespace = key.namespace, "Writing answer to cache");
                self.cache.put(key, &answer.message).await;
            }
        }

        Ok((answer, status))
    }

    async fn finish(&self, mut answer: Envelope, status: u16, job_id: &str) -> (Envelope, u16) {
        answer.push_log(LogLevel::Info, format!("pid: {}", job_id));
        answer.pid = Some(job_id.to_string());
        if status == 200 {
            answer.status = Some("Success".to_string());
            self.record(job_id, COMPLETE.to_string(), 200).await;
        } else {
            self.record(job_id, FAILED.to_string(), status).await;
        }
        info!(job_id = %job_id, status, results = answer.result_count(), "Query finished");
        (answer, status)
    }

    async fn record(&self, job_id: &str, msg: String, code: u16) {
        if let Err(e) = self.jobs.append(job_id, JobEntry::new(msg, code)).await {
            warn!(job_id = %job_id, error = %e, "Failed to write job log");
        }
    }

    /// Status of a job as derived from its log
    pub async fn status(&self, job_id: &str) -> Result<JobReport> {
        let entries = self.jobs.entries(job_id).await?;
        Ok(JobReport::from_entries(
            &entries,
            self.config.storage.stale_after(),
            chrono::Utc::now(),
        ))
    }

    /// Hand a callback reply to the round waiting on `correlation_id`.
    ///
    /// Payloads over the inline limit go to the blob store and only their
    /// key travels on the channel.
    pub async fn accept_callback(&self, correlation_id: &str, body: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&body)?;
        if bytes.len() <= self.config.storage.inline_payload_limit {
            return self
                .broker
                .publish(correlation_id, Delivery::Inline(body))
                .await;
        }

        let size = bytes.len();
        let key = self.blobs.put(bytes).await?;
        debug!(correlation_id = %correlation_id, key = %key, size, "Stored oversized callback");
        if let Err(e) = self
            .broker
            .publish(correlation_id, Delivery::Stored(key.clone()))
            .await
        {
            if let Err(cleanup) = self.blobs.delete(&key).await {
                warn!(key = %key, error = %cleanup, "Failed to remove undeliverable blob");
            }
            return Err(e);
        }
        Ok(())
    }

    /// The sub-queries a creative query would be expanded into
    pub fn expand(&self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        match classify(envelope.query_graph())? {
            QueryShape::Creative(creative) => expand(envelope, &creative, &self.rules),
            other => Err(Error::InvalidQuery(format!(
                "Only creative queries are expanded, this is a {} query",
                other.as_str()
            ))),
        }
    }
}

fn has_lookup_step(workflow: &[WorkflowStep]) -> bool {
    workflow.iter().any(|step| step.id == "lookup")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryResultStore;
    use crate::dispatch::{MemoryBlobStore, TransportReply};
    use crate::dispatch::transport::fake::ScriptedTransport;
    use crate::jobs::{JobStatus, MemoryJobLog};
    use serde_json::json;

    async fn federator(
        transport: Arc<ScriptedTransport>,
        limit: usize,
    ) -> (Federator, Arc<LocalBroker>, Arc<MemoryBlobStore>) {
        let mut config = Config::default();
        config.storage.inline_payload_limit = limit;
        let broker = Arc::new(LocalBroker::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let federator = Federator::builder(config)
            .transport(transport)
            .broker(broker.clone())
            .blob_store(blobs.clone())
            .result_store(Arc::new(MemoryResultStore::new()))
            .job_log(Arc::new(MemoryJobLog::new()))
            .rules(RuleLibrary::new())
            .build()
            .await
            .unwrap();
        (federator, broker, blobs)
    }

    fn unreachable_transport() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(|url, _| panic!("unexpected call to {}", url)))
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        for tweak in [
            (|c: &mut Config| c.retrieval.batch_size = 0) as fn(&mut Config),
            |c: &mut Config| c.retrieval.max_connections = 0,
        ] {
            let mut config = Config::default();
            tweak(&mut config);
            let result = Federator::builder(config)
                .transport(unreachable_transport())
                .result_store(Arc::new(MemoryResultStore::new()))
                .job_log(Arc::new(MemoryJobLog::new()))
                .blob_store(Arc::new(MemoryBlobStore::new()))
                .rules(RuleLibrary::new())
                .build()
                .await;
            let Err(err) = result else {
                panic!("invalid config was accepted");
            };
            assert!(matches!(err, Error::ConfigError(_)));
            assert_eq!(err.code(), "E600");
        }
    }

    #[tokio::test]
    async fn test_validation_error_fails_before_network() {
        let (federator, _, _) = federator(unreachable_transport(), 1024).await;
        let env: Envelope = serde_json::from_value(json!({"message": {"query_graph": {
            "nodes": {"a": {"ids": ["X:1"]}, "b": {"ids": ["X:2"]}},
            "edges": {"e": {"subject": "a", "object": "b", "predicates": ["biolink:treats"], "knowledge_type": "inferred"}}
        }}}))
        .unwrap();

        let err = federator.execute(env, "job").await.unwrap_err();
        assert!(matches!(err, Error::EndpointPinning(_)));
        assert!(err.is_client_error());
        assert_eq!(federator.status("job").await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_rejected() {
        let (federator, _, _) = federator(unreachable_transport(), 1024).await;
        let env: Envelope = serde_json::from_value(json!({
            "message": {"query_graph": {"nodes": {"a": {"ids": ["X:1"]}, "b": {}}, "edges": {"e": {"subject": "a", "object": "b"}}}},
            "workflow": [{"id": "lookup"}, {"id": "bake"}]
        }))
        .unwrap();
        let err = federator.execute(env, "job").await.unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    #[tokio::test]
    async fn test_accept_callback_inline_and_stored() {
        let (federator, broker, blobs) = federator(unreachable_transport(), 64).await;
        broker.provision("c1").await.unwrap();

        federator.accept_callback("c1", json!({"small": true})).await.unwrap();
        let big = json!({"message": {"padding": "x".repeat(200)}});
        federator.accept_callback("c1", big.clone()).await.unwrap();

        let mut stream = broker.open("c1").await.unwrap();
        assert_eq!(stream.next().await, Some(Delivery::Inline(json!({"small": true}))));
        let Some(Delivery::Stored(key)) = stream.next().await else {
            panic!("expected a stored delivery");
        };
        let bytes = blobs.take(&key).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), big);
    }

    #[tokio::test]
    async fn test_callback_to_unknown_channel_is_refused() {
        let (federator, _, blobs) = federator(unreachable_transport(), 8).await;
        let result = federator
            .accept_callback("nobody", json!({"message": {"padding": "xxxxxxxxxxxx"}}))
            .await;
        assert!(result.is_err());
        assert!(blobs.is_empty().await);
    }

    #[tokio::test]
    async fn test_expand_requires_creative_query() {
        let (federator, _, _) = federator(unreachable_transport(), 8).await;
        let env: Envelope = serde_json::from_value(json!({"message": {"query_graph": {
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}},
            "edges": {"e": {"subject": "a", "object": "b", "predicates": ["biolink:treats"]}}
        }}}))
        .unwrap();
        assert!(federator.expand(&env).is_err());
    }

    #[tokio::test]
    async fn test_plain_lookup_direct_mode() {
        let transport = Arc::new(ScriptedTransport::new(|url, body| {
            if url.ends_with("get_normalized_nodes") {
                return Ok(TransportReply::ok(json!({})));
            }
            let mut reply = body.clone();
            reply["message"]["knowledge_graph"] = json!({"nodes": {}, "edges": {}});
            reply["message"]["results"] = json!([{"node_bindings": {"a": [{"id": "X:1"}]}, "analyses": []}]);
            Ok(TransportReply::ok(reply))
        }));
        let mut config = Config::default();
        config.retrieval.mode = crate::config::RetrievalMode::Direct;
        let federator = Federator::builder(config)
            .transport(transport.clone())
            .blob_store(Arc::new(MemoryBlobStore::new()))
            .result_store(Arc::new(MemoryResultStore::new()))
            .job_log(Arc::new(MemoryJobLog::new()))
            .rules(RuleLibrary::new())
            .build()
            .await
            .unwrap();

        let env: Envelope = serde_json::from_value(json!({
            "message": {"query_graph": {"nodes": {"a": {"ids": ["X:1"]}, "b": {}}, "edges": {"e": {"subject": "a", "object": "b"}}}},
            "workflow": [{"id": "lookup"}]
        }))
        .unwrap();
        let (answer, status) = federator.execute(env, "job-1").await.unwrap();

        assert_eq!(status, 200);
        assert_eq!(answer.status.as_deref(), Some("Success"));
        assert_eq!(answer.pid.as_deref(), Some("job-1"));
        assert_eq!(answer.workflow, Some(vec![WorkflowStep::new("lookup")]));
        assert!(answer.logs.iter().any(|l| l.message == "pid: job-1"));
        assert!(transport.urls().contains(&"https://strider.renci.org/query".to_string()));
        assert_eq!(federator.status("job-1").await.unwrap().status, JobStatus::Completed);
    }
}
