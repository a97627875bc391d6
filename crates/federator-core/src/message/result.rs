//! Results, analyses and bindings

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::graph::Attribute;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub node_bindings: BTreeMap<String, Vec<NodeBinding>>,
    #[serde(default)]
    pub analyses: Vec<Analysis>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryResult {
    /// Set of knowledge edge ids referenced by all analyses
    pub fn evidence_signature(&self) -> BTreeSet<String> {
        self.analyses
            .iter()
            .flat_map(|a| a.edge_bindings.values())
            .flatten()
            .map(|b| b.id.clone())
            .collect()
    }

    /// Knowledge node ids bound to one query node
    pub fn bound_ids(&self, qnode_id: &str) -> BTreeSet<String> {
        self.node_bindings
            .get(qnode_id)
            .map(|bindings| bindings.iter().map(|b| b.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Best analysis score, 0 when nothing is scored
    pub fn best_score(&self) -> f64 {
        self.analyses
            .iter()
            .map(|a| a.score.unwrap_or(0.0))
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBinding {
    pub id: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeBinding {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeBinding {
    pub id: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EdgeBinding {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathBinding {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub edge_bindings: BTreeMap<String, Vec<EdgeBinding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_graphs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_bindings: Option<BTreeMap<String, Vec<PathBinding>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(value: Value) -> QueryResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_evidence_signature_spans_analyses() {
        let r = result(json!({
            "node_bindings": {"a": [{"id": "X:1"}]},
            "analyses": [
                {"edge_bindings": {"e0": [{"id": "k1"}, {"id": "k2"}]}},
                {"edge_bindings": {"e1": [{"id": "k2"}, {"id": "k3"}]}}
            ]
        }));
        let sig: Vec<_> = r.evidence_signature().into_iter().collect();
        assert_eq!(sig, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_best_score() {
        let r = result(json!({
            "node_bindings": {},
            "analyses": [{"edge_bindings": {}, "score": 0.2}, {"edge_bindings": {}, "score": 0.7}, {"edge_bindings": {}}]
        }));
        assert_eq!(r.best_score(), 0.7);
        assert_eq!(QueryResult::default().best_score(), 0.0);
    }

    #[test]
    fn test_bound_ids_missing_qnode() {
        let r = result(json!({"node_bindings": {"a": [{"id": "X:1"}, {"id": "X:2"}]}, "analyses": []}));
        assert_eq!(r.bound_ids("a").len(), 2);
        assert!(r.bound_ids("zzz").is_empty());
    }
}
