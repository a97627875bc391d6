//! Query shape classification

use crate::error::{Error, Result};
use crate::message::QueryGraph;

/// Number of inferred edges that marks a pathfinder query
const PATHFINDER_EDGES: usize = 3;

/// How a query graph will be answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    /// Only lookup edges; sent to retrieval as-is
    Lookup,
    /// A single inferred edge between one pinned and one free node
    Creative(CreativeQuery),
    /// Three inferred edges; handled by the pathfinder collaborator
    Pathfinder,
}

impl QueryShape {
    pub fn is_creative(&self) -> bool {
        matches!(self, Self::Creative(_))
    }

    pub fn is_pathfinder(&self) -> bool {
        matches!(self, Self::Pathfinder)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Creative(_) => "creative",
            Self::Pathfinder => "pathfinder",
        }
    }
}

/// Query node and edge ids of a creative query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreativeQuery {
    pub edge_id: String,
    /// The pinned endpoint
    pub question_node: String,
    /// The free endpoint; results are grouped by it
    pub answer_node: String,
}

/// Determine the shape of a query graph, rejecting shapes the engine cannot answer
pub fn classify(query_graph: Option<&QueryGraph>) -> Result<QueryShape> {
    let qg = query_graph.ok_or_else(|| Error::InvalidQuery("No query graph".to_string()))?;

    let inferred = qg.inferred_edges();
    let n_inferred = inferred.len();

    if n_inferred > 1 && n_inferred != PATHFINDER_EDGES {
        return Err(Error::MixedOrMultiInfer(
            "Only a single infer edge is supported".to_string(),
        ));
    }
    if n_inferred > 0 && n_inferred < qg.edges.len() {
        return Err(Error::MixedOrMultiInfer(
            "Mixed infer and lookup queries not supported".to_string(),
        ));
    }

    match n_inferred {
        0 => Ok(QueryShape::Lookup),
        PATHFINDER_EDGES => Ok(QueryShape::Pathfinder),
        _ => classify_creative(qg, inferred[0]).map(QueryShape::Creative),
    }
}

fn classify_creative(qg: &QueryGraph, edge_id: &str) -> Result<CreativeQuery> {
    let edge = &qg.edges[edge_id];

    let subject = qg.nodes.get(&edge.subject).ok_or_else(|| {
        Error::InvalidQuery(format!("Edge {} references unknown node {}", edge_id, edge.subject))
    })?;
    let object = qg.nodes.get(&edge.object).ok_or_else(|| {
        Error::InvalidQuery(format!("Edge {} references unknown node {}", edge_id, edge.object))
    })?;

    if let Some(stray) = qg
        .nodes
        .keys()
        .find(|id| **id != edge.subject && **id != edge.object)
    {
        return Err(Error::InvalidQuery(format!(
            "Creative queries take exactly two nodes; {} is not an endpoint of {}",
            stray, edge_id
        )));
    }

    let (question_node, answer_node) = match (subject.is_pinned(), object.is_pinned()) {
        (true, false) => (&edge.subject, &edge.object),
        (false, true) => (&edge.object, &edge.subject),
        (true, true) => {
            return Err(Error::EndpointPinning(
                "Both nodes of creative edge pinned".to_string(),
            ));
        }
        (false, false) => {
            return Err(Error::EndpointPinning(
                "No nodes of creative edge pinned".to_string(),
            ));
        }
    };

    if edge.first_predicate().is_none() {
        return Err(Error::InvalidQuery(format!(
            "Inferred edge {} has no predicate",
            edge_id
        )));
    }

    Ok(CreativeQuery {
        edge_id: edge_id.to_string(),
        question_node: question_node.clone(),
        answer_node: answer_node.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn qg(value: Value) -> QueryGraph {
        serde_json::from_value(value).unwrap()
    }

    fn inferred_edge(subject: &str, object: &str) -> Value {
        json!({"subject": subject, "object": object, "predicates": ["biolink:treats"], "knowledge_type": "inferred"})
    }

    #[test]
    fn test_classify_lookup() {
        let graph = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}, "c": {}},
            "edges": {"e0": {"subject": "a", "object": "b"}, "e1": {"subject": "b", "object": "c"}}
        }));
        assert_eq!(classify(Some(&graph)).unwrap(), QueryShape::Lookup);
    }

    #[test]
    fn test_classify_creative_pinned_object() {
        let graph = qg(json!({
            "nodes": {"disease": {"ids": ["MONDO:0008029"]}, "chemical": {"categories": ["biolink:ChemicalEntity"]}},
            "edges": {"t": inferred_edge("chemical", "disease")}
        }));
        let shape = classify(Some(&graph)).unwrap();
        assert_eq!(
            shape,
            QueryShape::Creative(CreativeQuery {
                edge_id: "t".to_string(),
                question_node: "disease".to_string(),
                answer_node: "chemical".to_string(),
            })
        );
    }

    #[test]
    fn test_classify_creative_pinned_subject() {
        let graph = qg(json!({
            "nodes": {"on": {"ids": ["X:1"]}, "sn": {}},
            "edges": {"e": inferred_edge("on", "sn")}
        }));
        let QueryShape::Creative(c) = classify(Some(&graph)).unwrap() else {
            panic!("expected creative");
        };
        assert_eq!(c.question_node, "on");
        assert_eq!(c.answer_node, "sn");
    }

    #[test]
    fn test_classify_two_inferred_fails() {
        let graph = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}, "c": {}},
            "edges": {"e0": inferred_edge("a", "b"), "e1": inferred_edge("b", "c")}
        }));
        let err = classify(Some(&graph)).unwrap_err();
        assert!(matches!(err, Error::MixedOrMultiInfer(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_classify_pathfinder() {
        let graph = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {"ids": ["X:2"]}, "c": {}},
            "edges": {"e0": inferred_edge("a", "b"), "e1": inferred_edge("a", "c"), "e2": inferred_edge("c", "b")}
        }));
        assert_eq!(classify(Some(&graph)).unwrap(), QueryShape::Pathfinder);
    }

    #[test]
    fn test_classify_mixed_fails() {
        let graph = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}, "c": {}},
            "edges": {"e0": inferred_edge("a", "b"), "e1": {"subject": "b", "object": "c"}}
        }));
        let err = classify(Some(&graph)).unwrap_err();
        assert_eq!(err.to_string(), "Mixed infer and lookup queries not supported");
    }

    #[test]
    fn test_classify_pinning_errors() {
        let both = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {"ids": ["X:2"]}},
            "edges": {"e": inferred_edge("a", "b")}
        }));
        assert!(matches!(
            classify(Some(&both)).unwrap_err(),
            Error::EndpointPinning(_)
        ));

        let neither = qg(json!({
            "nodes": {"a": {}, "b": {}},
            "edges": {"e": inferred_edge("a", "b")}
        }));
        assert_eq!(
            classify(Some(&neither)).unwrap_err().to_string(),
            "No nodes of creative edge pinned"
        );
    }

    #[test]
    fn test_classify_rejects_extra_free_node() {
        let graph = qg(json!({
            "nodes": {"a": {"ids": ["X:1"]}, "b": {}, "c": {}},
            "edges": {"e": inferred_edge("a", "b")}
        }));
        assert!(matches!(
            classify(Some(&graph)).unwrap_err(),
            Error::InvalidQuery(_)
        ));
    }

    #[test]
    fn test_classify_missing_query_graph() {
        assert!(classify(None).unwrap_err().is_client_error());
    }
}
