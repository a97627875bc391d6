//! Structural cleanups applied to result sets

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::message::{Message, QueryResult};

/// Default cap used by `filter_results_top_n` when none is given
pub const DEFAULT_MAX_RESULTS: usize = 20_000;

/// Whether no two query nodes are bound to the same set of knowledge nodes
pub fn has_unique_nodes(result: &QueryResult) -> bool {
    let mut seen = HashSet::new();
    result
        .node_bindings
        .values()
        .map(|bindings| bindings.iter().map(|b| b.id.as_str()).collect::<BTreeSet<_>>())
        .all(|ids| seen.insert(ids))
}

/// Drop results that bind one knowledge node set to two query nodes.
///
/// Prunes orphans if anything was dropped. Returns the number dropped.
pub fn filter_repeated_nodes(message: &mut Message) -> usize {
    let Some(results) = message.results.as_mut() else {
        return 0;
    };
    let before = results.len();
    results.retain(has_unique_nodes);
    let dropped = before - results.len();
    if dropped > 0 {
        debug!(dropped, "Removed results with repeated nodes");
        prune_orphans(message);
    }
    dropped
}

/// Query nodes sitting at the center of two edges that share a subject or
/// object and have the same predicates and qualifier constraints
pub fn promiscuous_qnodes(message: &Message) -> Vec<String> {
    let Some(qg) = message.query_graph.as_ref() else {
        return Vec::new();
    };
    if qg.edges.len() < 3 {
        return Vec::new();
    }

    let mut by_subject: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut by_object: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, edge) in &qg.edges {
        by_subject.entry(&edge.subject).or_default().push(id);
        by_object.entry(&edge.object).or_default().push(id);
    }

    let mut centers = Vec::new();
    for grouping in [&by_subject, &by_object] {
        for (node, edge_ids) in grouping {
            for (i, first) in edge_ids.iter().enumerate() {
                for second in &edge_ids[i + 1..] {
                    let (e1, e2) = (&qg.edges[*first], &qg.edges[*second]);
                    if e1.predicates == e2.predicates && e1.constraints() == e2.constraints() {
                        centers.push(node.to_string());
                    }
                }
            }
        }
    }
    centers.sort();
    centers.dedup();
    centers
}

/// Remove results whose hub node is bound to an overly common knowledge node.
///
/// Only applies to hub-shaped query graphs with more than `ceiling` results.
/// Returns the number of results removed.
pub fn filter_promiscuous_results(message: &mut Message, ceiling: usize) -> usize {
    if message.results().len() <= ceiling {
        return 0;
    }
    let hubs = promiscuous_qnodes(message);
    let results = message.results_mut();
    let before = results.len();
    for hub in hubs {
        remove_promiscuous_knodes(results, &hub, ceiling);
    }
    let removed = before - results.len();
    if removed > 0 {
        info!(removed, ceiling, "Removed results bound to promiscuous nodes");
    }
    removed
}

fn remove_promiscuous_knodes(results: &mut Vec<QueryResult>, hub: &str, ceiling: usize) {
    loop {
        let mut order: Vec<&str> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for result in results.iter() {
            for binding in result.node_bindings.get(hub).into_iter().flatten() {
                let count = counts.entry(binding.id.as_str()).or_insert(0);
                if *count == 0 {
                    order.push(binding.id.as_str());
                }
                *count += 1;
            }
        }

        let mut worst: Option<(&str, usize)> = None;
        for knode in order {
            let count = counts[knode];
            if worst.is_none_or(|(_, max)| count > max) {
                worst = Some((knode, count));
            }
        }

        match worst {
            Some((knode, count)) if count > ceiling => {
                let knode = knode.to_string();
                debug!(hub = %hub, knode = %knode, count, "Dropping promiscuous node");
                results.retain(|r| {
                    !r.node_bindings
                        .get(hub)
                        .is_some_and(|bs| bs.iter().any(|b| b.id == knode))
                });
            }
            _ => return,
        }
    }
}

/// Remove knowledge graph nodes, edges and auxiliary graphs not reachable
/// from the results.
///
/// Reachability starts at node bindings, edge bindings, analysis support
/// graphs and path bindings, then follows support graphs and auxiliary graph
/// edges transitively. Endpoints of every kept edge are kept.
pub fn prune_orphans(message: &mut Message) {
    let mut nodes: HashSet<String> = HashSet::new();
    let mut edges: HashSet<String> = HashSet::new();
    let mut aux: HashSet<String> = HashSet::new();
    let mut edge_queue: Vec<String> = Vec::new();
    let mut aux_queue: Vec<String> = Vec::new();

    for result in message.results() {
        for bindings in result.node_bindings.values() {
            nodes.extend(bindings.iter().map(|b| b.id.clone()));
        }
        for analysis in &result.analyses {
            for bindings in analysis.edge_bindings.values() {
                edge_queue.extend(bindings.iter().map(|b| b.id.clone()));
            }
            for bindings in analysis.path_bindings.iter().flat_map(|p| p.values()) {
                aux_queue.extend(bindings.iter().map(|b| b.id.clone()));
            }
            aux_queue.extend(analysis.support_graphs.iter().flatten().cloned());
        }
    }

    let empty_kg = Default::default();
    let kg = message.knowledge_graph.as_ref().unwrap_or(&empty_kg);
    let empty_aux = HashMap::new();
    let aux_graphs = message.auxiliary_graphs.as_ref().unwrap_or(&empty_aux);

    while !edge_queue.is_empty() || !aux_queue.is_empty() {
        while let Some(edge_id) = edge_queue.pop() {
            if !edges.insert(edge_id.clone()) {
                continue;
            }
            match kg.edges.get(&edge_id) {
                Some(edge) => {
                    nodes.insert(edge.subject.clone());
                    nodes.insert(edge.object.clone());
                    aux_queue.extend(edge.support_graphs().map(str::to_string));
                }
                None => warn!(edge = %edge_id, "Bound edge missing from knowledge graph"),
            }
        }
        while let Some(aux_id) = aux_queue.pop() {
            if !aux.insert(aux_id.clone()) {
                continue;
            }
            if let Some(graph) = aux_graphs.get(&aux_id) {
                edge_queue.extend(graph.edges.iter().cloned());
            }
        }
    }

    if let Some(kg) = message.knowledge_graph.as_mut() {
        let (node_count, edge_count) = (kg.nodes.len(), kg.edges.len());
        kg.nodes.retain(|id, _| nodes.contains(id));
        kg.edges.retain(|id, _| edges.contains(id));
        debug!(
            nodes_removed = node_count - kg.nodes.len(),
            edges_removed = edge_count - kg.edges.len(),
            "Pruned knowledge graph"
        );
    }
    if let Some(graphs) = message.auxiliary_graphs.as_mut() {
        graphs.retain(|id, _| aux.contains(id));
    }
}

/// Order results by best analysis score
pub fn sort_by_score(message: &mut Message, descending: bool) {
    let results = message.results_mut();
    if descending {
        results.sort_by(|a, b| b.best_score().total_cmp(&a.best_score()));
    } else {
        results.sort_by(|a, b| a.best_score().total_cmp(&b.best_score()));
    }
}

/// Keep the first `n` results
pub fn truncate_results(message: &mut Message, n: usize) {
    message.results_mut().truncate(n);
}

/// Sort, and only when more than `n` results remain truncate and prune.
///
/// Returns whether anything was cut.
pub fn message_top_n(message: &mut Message, n: usize, descending: bool) -> bool {
    sort_by_score(message, descending);
    if message.results().len() > n {
        truncate_results(message, n);
        prune_orphans(message);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn message(value: Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_repeated_node_result_removed_siblings_intact() {
        let mut m = message(json!({
            "query_graph": {"nodes": {"a": {}, "b": {}, "c": {}}, "edges": {}},
            "knowledge_graph": {
                "nodes": {"A": {}, "B": {}, "C": {}, "D": {}},
                "edges": {
                    "ab": {"subject": "A", "object": "B", "predicate": "p"},
                    "ba": {"subject": "B", "object": "A", "predicate": "p"},
                    "cd": {"subject": "C", "object": "D", "predicate": "p"}
                }
            },
            "results": [
                {"node_bindings": {"a": [{"id": "A"}], "b": [{"id": "B"}], "c": [{"id": "A"}]},
                 "analyses": [{"edge_bindings": {"x": [{"id": "ab"}, {"id": "ba"}]}}]},
                {"node_bindings": {"a": [{"id": "A"}], "b": [{"id": "C"}], "c": [{"id": "D"}]},
                 "analyses": [{"edge_bindings": {"x": [{"id": "cd"}]}}]}
            ]
        }));

        assert_eq!(filter_repeated_nodes(&mut m), 1);
        assert_eq!(m.results().len(), 1);
        let kg = m.knowledge_graph.as_ref().unwrap();
        assert!(kg.edges.contains_key("cd"));
        assert!(!kg.edges.contains_key("ab"));
        assert!(!kg.edges.contains_key("ba"));
        assert!(kg.nodes.contains_key("A"));
        assert!(kg.nodes.contains_key("C"));
        assert!(kg.nodes.contains_key("D"));
        assert!(!kg.nodes.contains_key("B"));
    }

    #[test]
    fn test_unique_nodes_allows_disjoint_sets() {
        let r: QueryResult = serde_json::from_value(json!({
            "node_bindings": {"a": [{"id": "A"}, {"id": "B"}], "b": [{"id": "A"}]},
            "analyses": []
        }))
        .unwrap();
        assert!(has_unique_nodes(&r));
    }

    #[test]
    fn test_prune_follows_nested_support_graphs() {
        let mut m = message(json!({
            "knowledge_graph": {
                "nodes": {"A": {}, "B": {}, "C": {}, "Z": {}},
                "edges": {
                    "top": {"subject": "A", "object": "B", "predicate": "p", "attributes": [
                        {"attribute_type_id": "biolink:support_graphs", "value": ["g1"]}
                    ]},
                    "mid": {"subject": "B", "object": "C", "predicate": "p", "attributes": [
                        {"attribute_type_id": "biolink:support_graphs", "value": ["g2"]}
                    ]},
                    "deep": {"subject": "C", "object": "A", "predicate": "p"},
                    "orphan": {"subject": "Z", "object": "Z", "predicate": "p"}
                }
            },
            "auxiliary_graphs": {
                "g1": {"edges": ["mid"]},
                "g2": {"edges": ["deep", "missing"]},
                "g3": {"edges": ["orphan"]}
            },
            "results": [{"node_bindings": {"a": [{"id": "A"}]},
                         "analyses": [{"edge_bindings": {"e": [{"id": "top"}]}}]}]
        }));

        prune_orphans(&mut m);
        let kg = m.knowledge_graph.as_ref().unwrap();
        let mut edges: Vec<_> = kg.edges.keys().cloned().collect();
        edges.sort();
        assert_eq!(edges, vec!["deep", "mid", "top"]);
        assert!(!kg.nodes.contains_key("Z"));
        assert_eq!(kg.nodes.len(), 3);
        let aux = m.auxiliary_graphs.as_ref().unwrap();
        assert!(aux.contains_key("g1") && aux.contains_key("g2"));
        assert!(!aux.contains_key("g3"));
    }

    #[test]
    fn test_prune_handles_support_cycles() {
        let mut m = message(json!({
            "knowledge_graph": {"nodes": {}, "edges": {
                "e1": {"subject": "A", "object": "B", "predicate": "p", "attributes": [
                    {"attribute_type_id": "biolink:support_graphs", "value": ["g"]}]}
            }},
            "auxiliary_graphs": {"g": {"edges": ["e1"]}},
            "results": [{"node_bindings": {}, "analyses": [{"edge_bindings": {}, "support_graphs": ["g"]}]}]
        }));
        prune_orphans(&mut m);
        assert!(m.knowledge_graph.unwrap().edges.contains_key("e1"));
    }

    fn hub_message(hub_counts: &[(&str, usize)]) -> Message {
        let mut results = Vec::new();
        let mut n = 0;
        for (knode, count) in hub_counts {
            for _ in 0..*count {
                n += 1;
                results.push(json!({
                    "node_bindings": {"a": [{"id": "A"}], "b": [{"id": format!("B{}", n)}],
                                      "c": [{"id": knode}], "d": [{"id": format!("D{}", n)}]},
                    "analyses": []
                }));
            }
        }
        message(json!({
            "query_graph": {
                "nodes": {"a": {"ids": ["A"]}, "b": {}, "c": {}, "d": {}},
                "edges": {
                    "e0": {"subject": "b", "object": "a", "predicates": ["biolink:treats"]},
                    "e1": {"subject": "b", "object": "c", "predicates": ["biolink:part_of"]},
                    "e2": {"subject": "d", "object": "c", "predicates": ["biolink:part_of"]}
                }
            },
            "results": results
        }))
    }

    #[test]
    fn test_promiscuous_hub_detected() {
        assert_eq!(promiscuous_qnodes(&hub_message(&[])), vec!["c"]);
    }

    #[test]
    fn test_promiscuous_results_removed() {
        let mut m = hub_message(&[("BIG", 12), ("OTHER", 11), ("SMALL", 3)]);
        let removed = filter_promiscuous_results(&mut m, 10);
        assert_eq!(removed, 23);
        assert_eq!(m.results().len(), 3);
        assert!(m.results().iter().all(|r| r.node_bindings["c"][0].id == "SMALL"));
    }

    #[test]
    fn test_promiscuity_needs_enough_results() {
        let mut m = hub_message(&[("BIG", 10)]);
        assert_eq!(filter_promiscuous_results(&mut m, 10), 0);
        assert_eq!(m.results().len(), 10);
    }

    #[test]
    fn test_message_top_n_sorts_and_prunes() {
        let mut m = message(json!({
            "knowledge_graph": {"nodes": {"A": {}, "B": {}}, "edges": {}},
            "results": [
                {"node_bindings": {"n": [{"id": "A"}]}, "analyses": [{"edge_bindings": {}, "score": 0.1}]},
                {"node_bindings": {"n": [{"id": "B"}]}, "analyses": [{"edge_bindings": {}, "score": 0.9}]}
            ]
        }));
        assert!(!message_top_n(&mut m, 5, true));
        assert_eq!(m.results()[0].node_bindings["n"][0].id, "B");

        assert!(message_top_n(&mut m, 1, true));
        assert_eq!(m.results().len(), 1);
        let kg = m.knowledge_graph.as_ref().unwrap();
        assert!(kg.nodes.contains_key("B") && !kg.nodes.contains_key("A"));
    }

    #[test]
    fn test_sort_ascending() {
        let mut m = message(json!({"results": [
            {"node_bindings": {}, "analyses": [{"edge_bindings": {}, "score": 0.9}]},
            {"node_bindings": {}, "analyses": [{"edge_bindings": {}, "score": 0.1}]}
        ]}));
        sort_by_score(&mut m, false);
        assert_eq!(m.results()[0].best_score(), 0.1);
    }
}
