//! Read-through/write-through result cache
//!
//! Creative answers are keyed by what was asked (predicate, pinned id,
//! direction, qualifiers, caller and workflow) rather than by query-node
//! labels, so a hit has to be rewritten onto the caller's identifiers before
//! it is returned. Lookup answers are keyed by the full query graph.
//!
//! The gateway never fails a request: store errors are logged and treated as
//! a miss.

pub mod store;

pub use store::{MemoryResultStore, ResultStore, SqliteResultStore, key_hash};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{Message, QueryGraph, WorkflowStep};
use crate::query::{InferredEdge, canonical_json};

pub const CREATIVE_NAMESPACE: &str = "creative";
pub const LOOKUP_NAMESPACE: &str = "lookup";

/// A canonical cache key together with the namespace it lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub text: String,
}

impl CacheKey {
    /// Key for a creative answer.
    ///
    /// Qualifier constraints are only part of the key when present; the
    /// multi-curie flag and member ids only for multi-curie queries.
    pub fn creative(
        inferred: &InferredEdge,
        caller: &str,
        workflow: &[WorkflowStep],
    ) -> Result<Self> {
        let mut key = Map::new();
        key.insert("predicate".into(), json!(inferred.predicate));
        key.insert("source_input".into(), json!(inferred.source_input));
        key.insert("input_id".into(), json!(inferred.input_id));
        key.insert("caller".into(), json!(caller));
        key.insert("workflow".into(), serde_json::to_value(workflow)?);
        if !inferred.qualifier_constraints.is_empty() {
            key.insert(
                "qualifier_constraints".into(),
                serde_json::to_value(&inferred.qualifier_constraints)?,
            );
        }
        if inferred.mcq {
            key.insert("mcq".into(), json!(true));
            key.insert("member_ids".into(), json!(inferred.member_ids));
        }

        Ok(Self {
            namespace: CREATIVE_NAMESPACE,
            text: canonical_json(&Value::Object(key))?,
        })
    }

    pub fn lookup(workflow: &[WorkflowStep], query_graph: &QueryGraph) -> Result<Self> {
        let key = json!({
            "workflow": workflow,
            "query_graph": query_graph,
        });
        Ok(Self {
            namespace: LOOKUP_NAMESPACE,
            text: canonical_json(&key)?,
        })
    }
}

/// gzip-compressed JSON
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(message)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

pub fn decode_message(payload: &[u8]) -> Result<Message> {
    let mut raw = Vec::new();
    GzDecoder::new(payload).read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Cache front used by the engine
#[derive(Clone)]
pub struct CacheGateway {
    store: Option<Arc<dyn ResultStore>>,
}

impl CacheGateway {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A gateway that always misses and drops writes
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Message> {
        let store = self.store.as_ref()?;
        let payload = match store.get(key.namespace, &key.text).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(namespace = key.namespace, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(namespace = key.namespace, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match decode_message(&payload) {
            Ok(message) => {
                info!(namespace = key.namespace, "Cache hit");
                Some(message)
            }
            Err(e) => {
                warn!(namespace = key.namespace, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &CacheKey, message: &Message) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let payload = match encode_message(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(namespace = key.namespace, error = %e, "Could not encode cache entry");
                return;
            }
        };
        if let Err(e) = store.put(key.namespace, &key.text, payload).await {
            warn!(namespace = key.namespace, error = %e, "Cache write failed");
        }
    }
}

/// Move a cached creative answer onto the caller's query identifiers.
///
/// Node bindings of the cached source and target query nodes and the edge
/// bindings of the cached inferred edge are renamed to the current query's
/// labels, and the cached query graph is replaced by the caller's.
pub fn rewrite_cached_result(mut cached: Message, query_graph: &QueryGraph) -> Result<Message> {
    let cached_qg = cached
        .query_graph
        .as_ref()
        .ok_or_else(|| Error::Cache("Cached answer has no query graph".to_string()))?;
    let was = InferredEdge::from_query_graph(cached_qg)?;
    let now = InferredEdge::from_query_graph(query_graph)?;

    let node_renames = [
        (was.source.as_str(), now.source.as_str()),
        (was.target.as_str(), now.target.as_str()),
    ];
    let edge_renames = [(was.edge_id.as_str(), now.edge_id.as_str())];

    for result in cached.results_mut() {
        rename_keys(&mut result.node_bindings, &node_renames);
        for analysis in &mut result.analyses {
            rename_keys(&mut analysis.edge_bindings, &edge_renames);
        }
    }

    debug!(
        from_source = %was.source,
        from_target = %was.target,
        to_source = %now.source,
        to_target = %now.target,
        "Rewrote cached answer"
    );
    cached.query_graph = Some(query_graph.clone());
    Ok(cached)
}

/// Rename all keys at once so that swapped labels do not clobber each other
fn rename_keys<V>(map: &mut BTreeMap<String, V>, renames: &[(&str, &str)]) {
    let moved: Vec<(String, V)> = renames
        .iter()
        .filter(|(from, to)| from != to)
        .filter_map(|(from, to)| map.remove(*from).map(|v| (to.to_string(), v)))
        .collect();
    for (key, value) in moved {
        map.insert(key, value);
    }
}
