//! Creative query expansion into concrete lookup queries

use std::collections::HashMap;
use tracing::{debug, warn};

use super::classifier::CreativeQuery;
use super::rules::{RuleLibrary, rule_key, substitute};
use crate::error::{Error, Result};
use crate::message::{Envelope, Message, QualifierConstraint, QueryGraph};

/// Everything the engine needs to know about the single inferred edge
#[derive(Debug, Clone, PartialEq)]
pub struct InferredEdge {
    pub edge_id: String,
    /// Query node id of the edge subject
    pub source: String,
    /// Query node id of the edge object
    pub target: String,
    pub predicate: String,
    pub qualifier_constraints: Vec<QualifierConstraint>,
    /// First id of the pinned endpoint
    pub input_id: String,
    /// Whether the subject is the pinned endpoint
    pub source_input: bool,
    /// Whether the pinned endpoint is a multi-curie set
    pub mcq: bool,
    pub member_ids: Vec<String>,
}

impl InferredEdge {
    /// Extract the inferred edge of a query graph with exactly one edge
    pub fn from_query_graph(qg: &QueryGraph) -> Result<Self> {
        let mut edges = qg.edges.iter();
        let (edge_id, edge) = match (edges.next(), edges.next()) {
            (Some(only), None) => only,
            _ => {
                return Err(Error::MixedOrMultiInfer(
                    "Only a single infer edge is supported".to_string(),
                ));
            }
        };

        let predicate = edge
            .first_predicate()
            .ok_or_else(|| {
                Error::InvalidQuery(format!("Inferred edge {} has no predicate", edge_id))
            })?
            .to_string();

        let node = |id: &str| {
            qg.nodes.get(id).ok_or_else(|| {
                Error::InvalidQuery(format!("Edge {} references unknown node {}", edge_id, id))
            })
        };
        let subject = node(&edge.subject)?;
        let object = node(&edge.object)?;

        let (pinned, source_input) = if subject.is_pinned() {
            (subject, true)
        } else if object.is_pinned() {
            (object, false)
        } else {
            return Err(Error::EndpointPinning(
                "No nodes of creative edge pinned".to_string(),
            ));
        };

        let input_id = pinned
            .ids
            .as_ref()
            .and_then(|ids| ids.first())
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            edge_id: edge_id.clone(),
            source: edge.subject.clone(),
            target: edge.object.clone(),
            predicate,
            qualifier_constraints: edge.constraints().to_vec(),
            input_id,
            source_input,
            mcq: pinned.is_multi_curie(),
            member_ids: pinned.member_ids.clone().unwrap_or_default(),
        })
    }

    /// Query node id of the free endpoint
    pub fn free_node(&self) -> &str {
        if self.source_input { &self.target } else { &self.source }
    }

    /// Query node id of the pinned endpoint
    pub fn pinned_node(&self) -> &str {
        if self.source_input { &self.source } else { &self.target }
    }

    pub fn rule_key(&self) -> Result<String> {
        rule_key(&self.predicate, &self.qualifier_constraints, self.mcq)
    }
}

/// Expand a creative query.
///
/// The first element is always the query itself with the inferred marker
/// stripped; it is the baseline the merger recognises as direct evidence.
/// Each matching rule then contributes one concrete lookup query. Rules whose
/// template cannot be instantiated are skipped.
pub fn expand(
    envelope: &Envelope,
    creative: &CreativeQuery,
    rules: &RuleLibrary,
) -> Result<Vec<Envelope>> {
    let qg = envelope
        .query_graph()
        .ok_or_else(|| Error::InvalidQuery("No query graph".to_string()))?;
    let inferred = InferredEdge::from_query_graph(qg)?;

    let mut baseline_qg = qg.clone();
    for edge in baseline_qg.edges.values_mut() {
        edge.knowledge_type = None;
    }

    let mut queries = vec![sub_query(envelope, baseline_qg, inferred.mcq)];

    let key = inferred.rule_key()?;
    let templates = rules.rules_for(&key);
    debug!(key = %key, templates = templates.len(), edge = %creative.edge_id, "Expanding inferred edge");

    let vars = if inferred.source_input {
        HashMap::from([
            ("source", inferred.source.as_str()),
            ("target", inferred.target.as_str()),
            ("source_id", inferred.input_id.as_str()),
            ("target_id", ""),
        ])
    } else {
        HashMap::from([
            ("source", inferred.source.as_str()),
            ("target", inferred.target.as_str()),
            ("source_id", ""),
            ("target_id", inferred.input_id.as_str()),
        ])
    };

    for (index, rule) in templates.iter().enumerate() {
        match instantiate(&rule.template, &vars, &inferred) {
            Ok(rule_qg) => queries.push(sub_query(envelope, rule_qg, inferred.mcq)),
            Err(e) => warn!(key = %key, index, error = %e, "Skipping rule template"),
        }
    }

    Ok(queries)
}

fn instantiate(
    template: &serde_json::Value,
    vars: &HashMap<&str, &str>,
    inferred: &InferredEdge,
) -> Result<QueryGraph> {
    let filled = substitute(template, vars)?;
    let message: Message = serde_json::from_value(filled)?;
    let mut qg = message
        .query_graph
        .ok_or_else(|| Error::RuleLibrary("Template has no query_graph".to_string()))?;

    let free = qg.nodes.get_mut(inferred.free_node()).ok_or_else(|| {
        Error::RuleLibrary(format!("Template lacks node {}", inferred.free_node()))
    })?;
    free.ids = None;
    free.member_ids = None;

    if inferred.mcq {
        let pinned = qg.nodes.get_mut(inferred.pinned_node()).ok_or_else(|| {
            Error::RuleLibrary(format!("Template lacks node {}", inferred.pinned_node()))
        })?;
        pinned.member_ids = Some(inferred.member_ids.clone());
    }

    Ok(qg)
}

/// Wrap a concrete query graph, carrying parameters, log level and, for
/// multi-curie queries, the original knowledge graph with its membership edges
fn sub_query(original: &Envelope, query_graph: QueryGraph, mcq: bool) -> Envelope {
    let mut message = Message {
        query_graph: Some(query_graph),
        ..Default::default()
    };
    if mcq {
        message.knowledge_graph = original.message.knowledge_graph.clone();
    }
    Envelope {
        message,
        parameters: Some(original.parameters.clone().unwrap_or_default()),
        log_level: original.log_level.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::classifier::{QueryShape, classify};
    use serde_json::{Value, json};

    const RULES: &str = r#"{
        "{\"predicate\": \"biolink:treats\"}": [
            {"Rule": "?b affects ?a", "template": {"query_graph": {
                "nodes": {"$source": {"ids": ["$source_id"]}, "$target": {"ids": ["$target_id"]}},
                "edges": {"e0": {"subject": "$source", "object": "$target", "predicates": ["biolink:affects"]}}
            }}},
            {"Rule": "?b ameliorates ?c, ?c part of ?a", "template": {"query_graph": {
                "nodes": {"$source": {"ids": ["$source_id"]}, "$target": {"ids": ["$target_id"]}, "i": {}},
                "edges": {
                    "e0": {"subject": "$source", "object": "i", "predicates": ["biolink:ameliorates"]},
                    "e1": {"subject": "i", "object": "$target", "predicates": ["biolink:part_of"]}
                }
            }}}
        ],
        "{\"mcq\": true, \"predicate\": \"biolink:treats\"}": [
            {"template": {"query_graph": {
                "nodes": {"$source": {"ids": ["$source_id"]}, "$target": {"ids": ["$target_id"]}},
                "edges": {"e0": {"subject": "$source", "object": "$target", "predicates": ["biolink:related_to"]}}
            }}}
        ]
    }"#;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    fn creative(env: &Envelope) -> CreativeQuery {
        match classify(env.query_graph()).unwrap() {
            QueryShape::Creative(c) => c,
            other => panic!("expected creative, got {:?}", other),
        }
    }

    fn treats_query() -> Envelope {
        envelope(json!({
            "message": {"query_graph": {
                "nodes": {"chemical": {"categories": ["biolink:ChemicalEntity"]}, "disease": {"ids": ["MONDO:0008029"]}},
                "edges": {"t": {"subject": "chemical", "object": "disease", "predicates": ["biolink:treats"], "knowledge_type": "inferred"}}
            }},
            "parameters": {"timeout_seconds": 60},
            "log_level": "DEBUG"
        }))
    }

    #[test]
    fn test_inferred_edge_parameters() {
        let env = treats_query();
        let inferred = InferredEdge::from_query_graph(env.query_graph().unwrap()).unwrap();
        assert_eq!(inferred.edge_id, "t");
        assert_eq!(inferred.source, "chemical");
        assert_eq!(inferred.target, "disease");
        assert_eq!(inferred.input_id, "MONDO:0008029");
        assert!(!inferred.source_input);
        assert!(!inferred.mcq);
        assert_eq!(inferred.free_node(), "chemical");
    }

    #[test]
    fn test_first_expansion_is_stripped_original() {
        let env = treats_query();
        let rules = RuleLibrary::from_json_str(RULES).unwrap();
        let queries = expand(&env, &creative(&env), &rules).unwrap();

        assert_eq!(queries.len(), 3);
        let mut expected = env.query_graph().unwrap().clone();
        expected.edges.get_mut("t").unwrap().knowledge_type = None;
        assert_eq!(queries[0].query_graph(), Some(&expected));
        assert_eq!(
            queries[0].query_graph().unwrap().nodes["disease"].ids,
            Some(vec!["MONDO:0008029".to_string()])
        );
    }

    #[test]
    fn test_rule_expansion_frees_answer_node() {
        let env = treats_query();
        let rules = RuleLibrary::from_json_str(RULES).unwrap();
        let queries = expand(&env, &creative(&env), &rules).unwrap();

        let rule_qg = queries[2].query_graph().unwrap();
        assert!(rule_qg.nodes["chemical"].ids.is_none());
        assert_eq!(
            rule_qg.nodes["disease"].ids,
            Some(vec!["MONDO:0008029".to_string()])
        );
        assert_eq!(rule_qg.edges["e1"].object, "disease");
        assert_eq!(queries[2].log_level.as_deref(), Some("DEBUG"));
        assert_eq!(queries[2].parameters.as_ref().unwrap()["timeout_seconds"], 60);
    }

    #[test]
    fn test_no_matching_rules_yields_baseline_only() {
        let env = treats_query();
        let queries = expand(&env, &creative(&env), &RuleLibrary::new()).unwrap();
        assert_eq!(queries.len(), 1);
    }

    #[test]
    fn test_mcq_expansion_carries_members_and_kg() {
        let env = envelope(json!({
            "message": {
                "query_graph": {
                    "nodes": {
                        "set": {"ids": ["uuid:1"], "set_interpretation": "MANY", "member_ids": ["MONDO:1", "MONDO:2"]},
                        "chem": {}
                    },
                    "edges": {"t": {"subject": "chem", "object": "set", "predicates": ["biolink:treats"], "knowledge_type": "inferred"}}
                },
                "knowledge_graph": {"nodes": {"MONDO:1": {}}, "edges": {"m": {"subject": "MONDO:1", "object": "uuid:1", "predicate": "biolink:member_of"}}}
            }
        }));
        let rules = RuleLibrary::from_json_str(RULES).unwrap();
        let queries = expand(&env, &creative(&env), &rules).unwrap();

        assert_eq!(queries.len(), 2);
        let rule_qg = queries[1].query_graph().unwrap();
        assert_eq!(
            rule_qg.nodes["set"].member_ids,
            Some(vec!["MONDO:1".to_string(), "MONDO:2".to_string()])
        );
        assert!(rule_qg.nodes["chem"].member_ids.is_none());
        for q in &queries {
            assert!(q.message.knowledge_graph.as_ref().unwrap().edges.contains_key("m"));
        }
    }

    #[test]
    fn test_broken_template_is_skipped() {
        let env = treats_query();
        let rules = RuleLibrary::from_json_str(
            r#"{"{\"predicate\":\"biolink:treats\"}": [
                {"template": {"query_graph": {"nodes": {"$unknown": {}}, "edges": {}}}},
                {"template": {"query_graph": {"nodes": {"$source": {}, "$target": {"ids": ["$target_id"]}}, "edges": {}}}}
            ]}"#,
        )
        .unwrap();
        let queries = expand(&env, &creative(&env), &rules).unwrap();
        assert_eq!(queries.len(), 2);
    }
}
