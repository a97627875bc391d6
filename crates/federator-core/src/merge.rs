//! Merging rule-expansion replies into one creative answer
//!
//! Every reply of a creative query binds the same answer query node. Results
//! are grouped by the knowledge nodes bound there; each group becomes one
//! result whose single analysis points the inferred query edge at a freshly
//! synthesized knowledge edge. That edge is supported by one auxiliary graph
//! per contributing rule result. Direct lookup evidence is bound as-is.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{
    Analysis, Attribute, AuxiliaryGraph, Edge, EdgeBinding, Envelope, KnowledgeGraph, Message,
    QueryGraph, QueryResult, RetrievalSource, SUPPORT_GRAPHS,
};

/// Results of one answer group, split by where they came from
#[derive(Debug, Default, Clone)]
pub struct AnswerGroup {
    pub creative: Vec<QueryResult>,
    pub lookup: Vec<QueryResult>,
}

/// Assemble normalized replies into one merged message.
///
/// The reply whose query graph is equivalent to `lookup_qg` supplies the
/// direct lookup results; all others are rule results. Knowledge graphs and
/// auxiliary graphs are unioned.
pub fn combine_messages(
    answer_qnode: &str,
    original_qg: &QueryGraph,
    lookup_qg: &QueryGraph,
    replies: Vec<Envelope>,
    resource_id: &str,
) -> Result<Message> {
    let mut kg = KnowledgeGraph::default();
    let mut aux: HashMap<String, AuxiliaryGraph> = HashMap::new();
    let mut creative = Vec::new();
    let mut lookup = Vec::new();

    for reply in replies {
        let Message {
            query_graph,
            knowledge_graph,
            results,
            auxiliary_graphs,
            ..
        } = reply.message;

        if let Some(reply_kg) = knowledge_graph {
            kg.absorb(reply_kg);
        }
        aux.extend(auxiliary_graphs.unwrap_or_default());

        let results = results.unwrap_or_default();
        if query_graph.as_ref().is_some_and(|qg| qg.equivalent(lookup_qg)) {
            lookup.extend(results);
        } else {
            creative.extend(results);
        }
    }

    debug!(
        creative = creative.len(),
        lookup = lookup.len(),
        nodes = kg.nodes.len(),
        edges = kg.edges.len(),
        "Combining replies"
    );

    let mut message = Message {
        query_graph: Some(original_qg.clone()),
        knowledge_graph: Some(kg),
        results: Some(creative),
        auxiliary_graphs: Some(aux),
        ..Default::default()
    };
    merge_results_by_node(&mut message, answer_qnode, lookup, resource_id)?;
    Ok(message)
}

/// Replace the message's results with one merged result per distinct set of
/// knowledge nodes bound to `merge_qnode`.
///
/// The message's current results are treated as rule results and
/// `lookup_results` as direct evidence.
pub fn merge_results_by_node(
    message: &mut Message,
    merge_qnode: &str,
    lookup_results: Vec<QueryResult>,
    resource_id: &str,
) -> Result<()> {
    let creative = message.results.take().unwrap_or_default();
    let groups = group_results_by_qnode(merge_qnode, creative, lookup_results);

    let qnode_ids: Vec<String> = message
        .query_graph
        .as_ref()
        .map(|qg| qg.nodes.keys().cloned().collect())
        .unwrap_or_default();

    let mut merged = Vec::with_capacity(groups.len());
    for (answer, group) in groups {
        merged.push(merge_answer(message, &answer, group, &qnode_ids, resource_id)?);
    }

    info!(merged = merged.len(), qnode = %merge_qnode, "Merged results by node");
    message.results = Some(merged);
    Ok(())
}

/// Group by bound knowledge node set, in order of first appearance
pub fn group_results_by_qnode(
    merge_qnode: &str,
    creative: Vec<QueryResult>,
    lookup: Vec<QueryResult>,
) -> Vec<(BTreeSet<String>, AnswerGroup)> {
    let mut groups: Vec<(BTreeSet<String>, AnswerGroup)> = Vec::new();
    let mut index: HashMap<BTreeSet<String>, usize> = HashMap::new();

    let tagged = creative
        .into_iter()
        .map(|r| (r, true))
        .chain(lookup.into_iter().map(|r| (r, false)));
    for (result, is_creative) in tagged {
        let bound = result.bound_ids(merge_qnode);
        let slot = *index.entry(bound.clone()).or_insert_with(|| {
            groups.push((bound, AnswerGroup::default()));
            groups.len() - 1
        });
        let group = &mut groups[slot].1;
        if is_creative {
            group.creative.push(result);
        } else {
            group.lookup.push(result);
        }
    }
    groups
}

/// Fold one answer group into a single result
pub fn merge_answer(
    message: &mut Message,
    answer: &BTreeSet<String>,
    group: AnswerGroup,
    qnode_ids: &[String],
    resource_id: &str,
) -> Result<QueryResult> {
    let AnswerGroup { creative, lookup } = group;

    // Rule results that repeat the direct evidence, or each other, add nothing
    let lookup_signatures: Vec<BTreeSet<String>> =
        lookup.iter().map(QueryResult::evidence_signature).collect();
    let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
    let creative: Vec<QueryResult> = creative
        .into_iter()
        .filter(|r| {
            let signature = r.evidence_signature();
            !lookup_signatures.contains(&signature) && seen.insert(signature)
        })
        .collect();

    let mut merged = QueryResult::default();
    for qnode in qnode_ids {
        let bindings = merged.node_bindings.entry(qnode.clone()).or_default();
        for result in creative.iter().chain(lookup.iter()) {
            for binding in result.node_bindings.get(qnode).into_iter().flatten() {
                if !bindings.contains(binding) {
                    bindings.push(binding.clone());
                }
            }
        }
    }

    let mut aux_graph_ids = Vec::new();
    for analysis in creative.iter().flat_map(|r| r.analyses.iter()) {
        let (id, graph) = create_aux_graph(analysis);
        message.auxiliary_graphs_mut().insert(id.clone(), graph);
        aux_graph_ids.push(id);
    }

    let mut knowledge_edge_ids = Vec::new();
    if !aux_graph_ids.is_empty() {
        for answer_id in answer {
            knowledge_edge_ids.push(add_knowledge_edge(
                message,
                &aux_graph_ids,
                answer_id,
                resource_id,
            )?);
        }
    }

    let qedge_id = message
        .query_graph
        .as_ref()
        .and_then(|qg| qg.edges.keys().next().cloned())
        .ok_or_else(|| Error::InvalidQuery("Query graph has no edges to merge on".to_string()))?;

    let mut edge_bindings: BTreeMap<String, Vec<EdgeBinding>> = BTreeMap::new();
    edge_bindings.insert(
        qedge_id,
        knowledge_edge_ids.into_iter().map(EdgeBinding::new).collect(),
    );
    for analysis in lookup.iter().flat_map(|r| r.analyses.iter()) {
        for (qedge, bindings) in &analysis.edge_bindings {
            edge_bindings
                .entry(qedge.clone())
                .or_default()
                .extend(bindings.iter().cloned());
        }
    }

    merged.analyses.push(Analysis {
        resource_id: Some(resource_id.to_string()),
        edge_bindings,
        ..Default::default()
    });
    Ok(merged)
}

/// Package an analysis's bound edges as a new auxiliary graph
pub fn create_aux_graph(analysis: &Analysis) -> (String, AuxiliaryGraph) {
    let mut edges: Vec<String> = Vec::new();
    for binding in analysis.edge_bindings.values().flatten() {
        if !edges.contains(&binding.id) {
            edges.push(binding.id.clone());
        }
    }
    (
        Uuid::new_v4().to_string(),
        AuxiliaryGraph {
            edges,
            ..Default::default()
        },
    )
}

/// Add the inferred edge for one answer, supported by `aux_graph_ids`
pub fn add_knowledge_edge(
    message: &mut Message,
    aux_graph_ids: &[String],
    answer: &str,
    resource_id: &str,
) -> Result<String> {
    let qg = message
        .query_graph
        .as_ref()
        .ok_or_else(|| Error::InvalidQuery("No query graph".to_string()))?;
    let qedge = qg
        .edges
        .values()
        .next()
        .ok_or_else(|| Error::InvalidQuery("Query graph has no edges".to_string()))?;

    let pinned_id = |qnode_id: &str| {
        qg.nodes
            .get(qnode_id)
            .and_then(|n| n.ids.as_ref())
            .and_then(|ids| ids.first())
            .cloned()
    };
    let (subject, object) = match pinned_id(&qedge.subject) {
        Some(id) => (id, answer.to_string()),
        None => (
            answer.to_string(),
            pinned_id(&qedge.object).ok_or_else(|| {
                Error::InvalidQuery(format!("Neither endpoint of {} is pinned", qedge.subject))
            })?,
        ),
    };

    let predicate = qedge
        .first_predicate()
        .ok_or_else(|| Error::InvalidQuery("Inferred edge has no predicate".to_string()))?
        .to_string();
    let qualifiers = qedge
        .constraints()
        .first()
        .map(|qc| qc.qualifier_set.clone());

    let edge = Edge {
        subject,
        object,
        predicate,
        qualifiers,
        sources: vec![RetrievalSource::new(resource_id, "primary_knowledge_source")],
        attributes: vec![
            Attribute::new(SUPPORT_GRAPHS, json!(aux_graph_ids)),
            Attribute::new("biolink:agent_type", json!("computational_model")).with_source(resource_id),
            Attribute::new("biolink:knowledge_level", json!("prediction")).with_source(resource_id),
        ],
        ..Default::default()
    };

    let id = Uuid::new_v4().to_string();
    message.knowledge_graph_mut().edges.insert(id.clone(), edge);
    Ok(id)
}
