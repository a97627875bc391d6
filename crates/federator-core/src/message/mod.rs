//! TRAPI message model
//!
//! Every struct keeps fields it does not model in a flattened `extra` map so
//! collaborator-specific content survives a round trip through the engine.

pub mod graph;
pub mod result;

pub use graph::{
    Attribute, AuxiliaryGraph, Edge, INFERRED, KnowledgeGraph, Node, QEdge, QNode, QueryGraph,
    Qualifier, QualifierConstraint, RetrievalSource, SUPPORT_GRAPHS,
};
pub use result::{Analysis, EdgeBinding, NodeBinding, PathBinding, QueryResult};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The request/response wrapper around a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Vec<WorkflowStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn from_query_graph(query_graph: QueryGraph) -> Self {
        Self {
            message: Message {
                query_graph: Some(query_graph),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// `parameters.overwrite_cache`, only honored when it is a real boolean
    pub fn overwrite_cache(&self) -> bool {
        self.parameters
            .as_ref()
            .and_then(|p| p.get("overwrite_cache"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `parameters.timeout_seconds`, if any was supplied.
    ///
    /// A value that is present but not a positive integer falls back to
    /// `fallback`.
    pub fn timeout_seconds(&self, fallback: u64) -> Option<u64> {
        let value = self.parameters.as_ref()?.get("timeout_seconds")?;
        match value {
            Value::Null | Value::Bool(false) => None,
            other => Some(other.as_u64().filter(|s| *s > 0).unwrap_or(fallback)),
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry::new(level, message));
    }

    pub fn query_graph(&self) -> Option<&QueryGraph> {
        self.message.query_graph.as_ref()
    }

    pub fn result_count(&self) -> usize {
        self.message.results().len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_graph: Option<QueryGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_graph: Option<KnowledgeGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<QueryResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_graphs: Option<HashMap<String, AuxiliaryGraph>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// `{query_graph, knowledge_graph: {nodes: {}, edges: {}}, results: []}`
    pub fn minimal(query_graph: Option<QueryGraph>) -> Self {
        Self {
            query_graph,
            knowledge_graph: Some(KnowledgeGraph::default()),
            results: Some(Vec::new()),
            auxiliary_graphs: None,
            extra: Map::new(),
        }
    }

    pub fn results(&self) -> &[QueryResult] {
        self.results.as_deref().unwrap_or(&[])
    }

    pub fn results_mut(&mut self) -> &mut Vec<QueryResult> {
        self.results.get_or_insert_with(Vec::new)
    }

    pub fn knowledge_graph_mut(&mut self) -> &mut KnowledgeGraph {
        self.knowledge_graph.get_or_insert_with(KnowledgeGraph::default)
    }

    pub fn auxiliary_graphs_mut(&mut self) -> &mut HashMap<String, AuxiliaryGraph> {
        self.auxiliary_graphs.get_or_insert_with(HashMap::new)
    }
}

/// One step of a workflow as the caller spells it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(id: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            parameters: match parameters {
                Value::Object(map) => Some(map),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// Diagnostic entry carried inside the response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: Some(level.as_str().to_string()),
            message: message.into(),
            code: None,
            extra: Map::new(),
        }
    }
}
