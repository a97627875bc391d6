//! Query graph, knowledge graph and auxiliary graph types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Value of `knowledge_type` marking an edge whose answer must be derived
pub const INFERRED: &str = "inferred";

/// Attribute type carrying auxiliary graph references on a knowledge edge
pub const SUPPORT_GRAPHS: &str = "biolink:support_graphs";

/// Pattern the caller asks to be matched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryGraph {
    #[serde(default)]
    pub nodes: BTreeMap<String, QNode>,
    #[serde(default)]
    pub edges: BTreeMap<String, QEdge>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryGraph {
    /// Ids of edges marked inferred, in key order
    pub fn inferred_edges(&self) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, edge)| edge.is_inferred())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Copy with the cosmetic differences producers introduce removed:
    /// `is_set: false`, and empty `constraints`, `attribute_constraints`
    /// or `qualifier_constraints`.
    pub fn canonicalized(&self) -> Self {
        let mut graph = self.clone();
        for node in graph.nodes.values_mut() {
            if node.extra.get("is_set") == Some(&Value::Bool(false)) {
                node.extra.remove("is_set");
            }
            remove_if_empty_array(&mut node.extra, "constraints");
        }
        for edge in graph.edges.values_mut() {
            remove_if_empty_array(&mut edge.extra, "attribute_constraints");
            if edge.qualifier_constraints.as_ref().is_some_and(Vec::is_empty) {
                edge.qualifier_constraints = None;
            }
        }
        graph
    }

    /// Structural equality modulo [`QueryGraph::canonicalized`]
    pub fn equivalent(&self, other: &QueryGraph) -> bool {
        self.canonicalized() == other.canonicalized()
    }
}

fn remove_if_empty_array(map: &mut Map<String, Value>, key: &str) {
    if map
        .get(key)
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty)
    {
        map.remove(key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_interpretation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_ids: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QNode {
    /// Whether the node carries at least one id
    pub fn is_pinned(&self) -> bool {
        self.ids.as_ref().is_some_and(|ids| !ids.is_empty())
    }

    /// Whether the node stands for a set of entities (multi-curie)
    pub fn is_multi_curie(&self) -> bool {
        self.set_interpretation.as_deref() == Some("MANY")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QEdge {
    pub subject: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicates: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier_constraints: Option<Vec<QualifierConstraint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QEdge {
    pub fn is_inferred(&self) -> bool {
        self.knowledge_type.as_deref() == Some(INFERRED)
    }

    pub fn first_predicate(&self) -> Option<&str> {
        self.predicates
            .as_ref()
            .and_then(|p| p.first())
            .map(String::as_str)
    }

    /// Qualifier constraints, treating absent as empty
    pub fn constraints(&self) -> &[QualifierConstraint] {
        self.qualifier_constraints.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualifierConstraint {
    #[serde(default)]
    pub qualifier_set: Vec<Qualifier>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    pub qualifier_type_id: String,
    pub qualifier_value: String,
}

/// Concrete evidence: nodes and edges keyed by globally unique ids
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub nodes: HashMap<String, Node>,
    #[serde(default)]
    pub edges: HashMap<String, Edge>,
}

impl KnowledgeGraph {
    /// Fold another graph into this one.
    ///
    /// New ids are inserted as-is. For ids present in both graphs the
    /// categories, attributes and sources are unioned so that no producer's
    /// provenance is lost.
    pub fn absorb(&mut self, other: KnowledgeGraph) {
        for (id, node) in other.nodes {
            match self.nodes.get_mut(&id) {
                Some(existing) => {
                    extend_unique(&mut existing.categories, node.categories);
                    extend_unique(&mut existing.attributes, node.attributes);
                    if existing.name.is_none() {
                        existing.name = node.name;
                    }
                }
                None => {
                    self.nodes.insert(id, node);
                }
            }
        }
        for (id, edge) in other.edges {
            match self.edges.get_mut(&id) {
                Some(existing) => {
                    extend_unique(&mut existing.attributes, edge.attributes);
                    extend_unique(&mut existing.sources, edge.sources);
                }
                None => {
                    self.edges.insert(id, edge);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

fn extend_unique<T: PartialEq>(into: &mut Vec<T>, from: Vec<T>) {
    for item in from {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub subject: String,
    pub object: String,
    pub predicate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifiers: Option<Vec<Qualifier>>,
    #[serde(default)]
    pub sources: Vec<RetrievalSource>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    /// Auxiliary graph ids referenced through `biolink:support_graphs`
    pub fn support_graphs(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.attribute_type_id == SUPPORT_GRAPHS)
            .filter_map(|a| a.value.as_array())
            .flatten()
            .filter_map(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub attribute_type_id: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_source: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Attribute {
    pub fn new(attribute_type_id: impl Into<String>, value: Value) -> Self {
        Self {
            attribute_type_id: attribute_type_id.into(),
            value,
            attribute_source: None,
            extra: Map::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.attribute_source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSource {
    pub resource_id: String,
    pub resource_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_resource_ids: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RetrievalSource {
    pub fn new(resource_id: impl Into<String>, resource_role: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_role: resource_role.into(),
            upstream_resource_ids: None,
            extra: Map::new(),
        }
    }
}

/// Named, immutable set of knowledge edge ids justifying a derived claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryGraph {
    #[serde(default)]
    pub edges: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(value: Value) -> QueryGraph {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_inferred_edges() {
        let qg = graph(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}},
            "edges": {
                "e0": {"subject": "a", "object": "b", "predicates": ["biolink:treats"], "knowledge_type": "inferred"},
                "e1": {"subject": "a", "object": "b"}
            }
        }));
        assert_eq!(qg.inferred_edges(), vec!["e0"]);
        assert!(qg.nodes["a"].is_pinned());
        assert!(!qg.nodes["b"].is_pinned());
    }

    #[test]
    fn test_equivalent_ignores_empty_constraints() {
        let plain = graph(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {"categories": ["biolink:Gene"]}},
            "edges": {"e": {"subject": "a", "object": "b", "predicates": ["biolink:related_to"]}}
        }));
        let noisy = graph(json!({
            "nodes": {
                "a": {"ids": ["X:1"], "is_set": false, "constraints": []},
                "b": {"categories": ["biolink:Gene"]}
            },
            "edges": {"e": {
                "subject": "a", "object": "b", "predicates": ["biolink:related_to"],
                "attribute_constraints": [], "qualifier_constraints": []
            }}
        }));
        assert!(plain.equivalent(&noisy));

        let different = graph(json!({
            "nodes": {"a": {"ids": ["X:1"], "is_set": true}, "b": {"categories": ["biolink:Gene"]}},
            "edges": {"e": {"subject": "a", "object": "b", "predicates": ["biolink:related_to"]}}
        }));
        assert!(!plain.equivalent(&different));
    }

    #[test]
    fn test_absorb_unions_sources() {
        let mut kg: KnowledgeGraph = serde_json::from_value(json!({
            "nodes": {"X:1": {"categories": ["biolink:Gene"]}},
            "edges": {"k1": {"subject": "X:1", "object": "Y:1", "predicate": "biolink:related_to",
                "sources": [{"resource_id": "infores:a", "resource_role": "primary_knowledge_source"}]}}
        }))
        .unwrap();
        let other: KnowledgeGraph = serde_json::from_value(json!({
            "nodes": {"X:1": {"categories": ["biolink:Gene", "biolink:Protein"]}, "Y:1": {}},
            "edges": {"k1": {"subject": "X:1", "object": "Y:1", "predicate": "biolink:related_to",
                "sources": [{"resource_id": "infores:b", "resource_role": "aggregator_knowledge_source"}]}}
        }))
        .unwrap();

        kg.absorb(other);
        assert_eq!(kg.nodes.len(), 2);
        assert_eq!(kg.nodes["X:1"].categories.len(), 2);
        assert_eq!(kg.edges["k1"].sources.len(), 2);
    }

    #[test]
    fn test_edge_support_graphs() {
        let edge: Edge = serde_json::from_value(json!({
            "subject": "a", "object": "b", "predicate": "biolink:treats",
            "attributes": [
                {"attribute_type_id": "biolink:support_graphs", "value": ["g1", "g2"]},
                {"attribute_type_id": "biolink:agent_type", "value": "computational_model"}
            ]
        }))
        .unwrap();
        assert_eq!(edge.support_graphs().collect::<Vec<_>>(), vec!["g1", "g2"]);
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let qg = graph(json!({
            "nodes": {"a": {"ids": ["X:1"], "custom": 3}},
            "edges": {}
        }));
        let back = serde_json::to_value(&qg).unwrap();
        assert_eq!(back["nodes"]["a"]["custom"], 3);
    }
}
