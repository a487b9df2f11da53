/// Load-time compilation of workflow definitions into executable graphs
///
/// Builds a petgraph DAG from the definition, rejects cycles and dangling
/// references, and precomputes the topological order the engine walks.

use crate::expression::Evaluator;
use crate::workflow::error::WorkflowError;
use crate::workflow::types::{CompiledNode, Edge, NodeKind, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Validated, immutable workflow ready for execution
#[derive(Debug)]
pub struct CompiledWorkflow {
    pub id: String,
    pub name: String,
    pub tenant_id: Option<String>,
    nodes: HashMap<String, Arc<CompiledNode>>,
    edges: Vec<Edge>,
    /// Top-level (non-owned) node IDs in topological order
    order: Vec<String>,
    /// Edge indices by source node
    outgoing: HashMap<String, Vec<usize>>,
    /// Edge indices by target node
    incoming: HashMap<String, Vec<usize>>,
    owned: HashSet<String>,
}

impl CompiledWorkflow {
    /// Validate `definition` and compile every node's config.
    pub fn compile(definition: WorkflowDefinition, evaluator: &Evaluator) -> Result<Self, WorkflowError> {
        tracing::debug!("🏗️ Compiling workflow '{}' ({} nodes, {} edges)",
            definition.id, definition.nodes.len(), definition.edges.len());

        if definition.nodes.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_id_to_index: HashMap<String, NodeIndex> = HashMap::new();
        let mut nodes = HashMap::new();

        for node in &definition.nodes {
            if node_id_to_index.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
            let kind = NodeKind::compile(node, evaluator)?;
            node_id_to_index.insert(node.id.clone(), graph.add_node(node.id.clone()));
            nodes.insert(node.id.clone(), Arc::new(CompiledNode { id: node.id.clone(), kind }));
        }

        let mut edges = definition.edges;
        for edge in &edges {
            for endpoint in [&edge.source, &edge.target] {
                if !nodes.contains_key(endpoint) {
                    return Err(WorkflowError::DanglingEdge {
                        source_id: edge.source.clone(),
                        target_id: edge.target.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        let mut owned = HashSet::new();
        // Owner -> owned edges, must stay acyclic.
        let mut ownership: DiGraph<String, ()> = DiGraph::new();
        let ownership_index: HashMap<&str, NodeIndex> = definition
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), ownership.add_node(node.id.clone())))
            .collect();
        for node in nodes.values() {
            for id in node.kind.owned_nodes() {
                let Some(target) = nodes.get(id) else {
                    return Err(WorkflowError::InvalidNode {
                        node_id: node.id.clone(),
                        reason: format!("references unknown node '{}'", id),
                    });
                };
                if id == node.id {
                    return Err(WorkflowError::InvalidNode {
                        node_id: node.id.clone(),
                        reason: "a control node cannot own itself".to_string(),
                    });
                }
                if matches!(target.kind, NodeKind::Conditional(_)) {
                    return Err(WorkflowError::InvalidNode {
                        node_id: node.id.clone(),
                        reason: format!("conditional '{}' can only run at the top level", id),
                    });
                }
                ownership.add_edge(ownership_index[node.id.as_str()], ownership_index[id], ());
                owned.insert(id.to_string());
            }

            if let NodeKind::Conditional(config) = &node.kind {
                // Config branch targets become labelled edges.
                for (label, target) in [("true", &config.true_branch), ("false", &config.false_branch)] {
                    let Some(target) = target else { continue };
                    if !nodes.contains_key(target) {
                        return Err(WorkflowError::InvalidNode {
                            node_id: node.id.clone(),
                            reason: format!("{} branch references unknown node '{}'", label, target),
                        });
                    }
                    let implicit = Edge {
                        source: node.id.clone(),
                        target: target.clone(),
                        label: Some(label.to_string()),
                    };
                    if !edges.contains(&implicit) {
                        edges.push(implicit);
                    }
                }
            }
        }

        if let Err(cycle) = toposort(&ownership, None) {
            let node_id = ownership[cycle.node_id()].clone();
            tracing::error!("❌ Workflow '{}' has an ownership cycle through '{}'", definition.id, node_id);
            return Err(WorkflowError::OwnershipCycle {
                workflow_id: definition.id.clone(),
                node_id,
            });
        }

        for edge in &edges {
            for endpoint in [&edge.source, &edge.target] {
                if owned.contains(endpoint) {
                    return Err(WorkflowError::InvalidNode {
                        node_id: endpoint.clone(),
                        reason: format!(
                            "owned node cannot be wired by edge {} -> {}",
                            edge.source, edge.target
                        ),
                    });
                }
            }
            let conditional = matches!(
                nodes.get(&edge.source).map(|n| &n.kind),
                Some(NodeKind::Conditional(_))
            );
            if conditional && !matches!(edge.label.as_deref(), Some("true") | Some("false")) {
                return Err(WorkflowError::InvalidNode {
                    node_id: edge.source.clone(),
                    reason: format!(
                        "edge to '{}' must be labelled \"true\" or \"false\"",
                        edge.target
                    ),
                });
            }
            graph.add_edge(node_id_to_index[&edge.source], node_id_to_index[&edge.target], ());
        }

        let topo_order = toposort(&graph, None).map_err(|_| {
            tracing::error!("❌ Workflow '{}' contains cycles - must be a DAG", definition.id);
            WorkflowError::Cycle(definition.id.clone())
        })?;

        let order: Vec<String> = topo_order
            .into_iter()
            .map(|idx| graph[idx].clone())
            .filter(|id| !owned.contains(id))
            .collect();

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(index);
            incoming.entry(edge.target.clone()).or_default().push(index);
        }

        tracing::debug!("📋 Execution order for '{}': {:?}", definition.id, order);

        Ok(Self {
            id: definition.id,
            name: definition.name,
            tenant_id: definition.tenant_id,
            nodes,
            edges,
            order,
            outgoing,
            incoming,
            owned,
        })
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<CompiledNode>> {
        self.nodes.get(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Top-level nodes in the order the engine visits them.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn edge(&self, index: usize) -> &Edge {
        &self.edges[index]
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_edges(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A top-level node with no incoming edge.
    pub fn is_root(&self, node_id: &str) -> bool {
        !self.owned.contains(node_id) && self.incoming_edges(node_id).is_empty()
    }

    pub fn is_owned(&self, node_id: &str) -> bool {
        self.owned.contains(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(definition: serde_json::Value) -> Result<CompiledWorkflow, WorkflowError> {
        let definition: WorkflowDefinition = serde_json::from_value(definition).unwrap();
        CompiledWorkflow::compile(definition, &Evaluator::new())
    }

    #[test]
    fn test_order_skips_owned_nodes() {
        let workflow = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "trigger:manual"},
                {"id": "guard", "type": "control:try", "config": {"try_nodes": ["risky"], "catch_nodes": ["recover"]}},
                {"id": "risky", "type": "action:error", "config": {"message": "boom"}},
                {"id": "recover", "type": "action:transform", "config": {"template": {"ok": true}}}
            ],
            "edges": [{"source": "start", "target": "guard"}]
        }))
        .unwrap();

        assert_eq!(workflow.execution_order(), ["start", "guard"]);
        assert!(workflow.is_root("start"));
        assert!(!workflow.is_root("guard"));
        assert!(workflow.is_owned("risky"));
        assert_eq!(workflow.node_count(), 4);
    }

    #[test]
    fn test_rejects_cycles() {
        let err = compile(json!({
            "id": "loopy",
            "nodes": [
                {"id": "a", "type": "trigger:manual"},
                {"id": "b", "type": "action:transform", "config": {"template": 1}},
                {"id": "c", "type": "action:transform", "config": {"template": 2}}
            ],
            "edges": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "c"},
                {"from": "c", "to": "b"}
            ]
        }))
        .unwrap_err();
        assert_eq!(err, WorkflowError::Cycle("loopy".to_string()));
    }

    #[test]
    fn test_rejects_duplicates_and_dangling_edges() {
        assert!(matches!(
            compile(json!({
                "id": "wf",
                "nodes": [{"id": "a", "type": "trigger:manual"}, {"id": "a", "type": "trigger:manual"}]
            })),
            Err(WorkflowError::DuplicateNode(_))
        ));
        assert!(matches!(
            compile(json!({
                "id": "wf",
                "nodes": [{"id": "a", "type": "trigger:manual"}],
                "edges": [{"source": "a", "target": "ghost"}]
            })),
            Err(WorkflowError::DanglingEdge { missing, .. }) if missing == "ghost"
        ));
    }

    #[test]
    fn test_conditional_edges_must_be_labelled() {
        let err = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "check", "type": "control:if", "config": {"condition": "trigger.ok == true"}},
                {"id": "next", "type": "action:transform", "config": {"template": 1}}
            ],
            "edges": [{"source": "check", "target": "next"}]
        }))
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode { node_id, .. } if node_id == "check"));
    }

    #[test]
    fn test_config_branches_become_edges() {
        let workflow = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "check", "type": "control:if",
                 "config": {"condition": "trigger.ok == true", "true_branch": "yes", "false_branch": "no"}},
                {"id": "yes", "type": "action:transform", "config": {"template": "y"}},
                {"id": "no", "type": "action:transform", "config": {"template": "n"}}
            ]
        }))
        .unwrap();
        let labels: Vec<_> = workflow
            .outgoing_edges("check")
            .iter()
            .map(|&i| workflow.edge(i).label.clone().unwrap())
            .collect();
        assert_eq!(labels, vec!["true", "false"]);
        assert_eq!(workflow.execution_order()[0], "check");
    }

    #[test]
    fn test_unknown_owned_reference() {
        let err = compile(json!({
            "id": "wf",
            "nodes": [{"id": "l", "type": "control:loop", "config": {"items": [1], "body_nodes": ["missing"]}}]
        }))
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode { .. }));
    }

    #[test]
    fn test_rejects_ownership_cycles() {
        let err = compile(json!({
            "id": "pair",
            "nodes": [
                {"id": "a", "type": "control:try", "config": {"try_nodes": ["b"]}},
                {"id": "b", "type": "control:loop", "config": {"items": [1], "body_nodes": ["a"]}}
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, WorkflowError::OwnershipCycle { workflow_id, .. } if workflow_id == "pair"));

        let err = compile(json!({
            "id": "triple",
            "nodes": [
                {"id": "x", "type": "control:try", "config": {"try_nodes": ["a"]}},
                {"id": "a", "type": "control:try", "config": {"try_nodes": ["b"]}},
                {"id": "b", "type": "control:parallel", "config": {"branches": [["a"]]}}
            ]
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::OwnershipCycle { node_id, .. } if node_id == "a" || node_id == "b"
        ));
    }

    #[test]
    fn test_nested_ownership_is_accepted() {
        let workflow = compile(json!({
            "id": "nested",
            "nodes": [
                {"id": "outer", "type": "control:try", "config": {"try_nodes": ["inner"], "finally_nodes": ["done"]}},
                {"id": "inner", "type": "control:loop", "config": {"items": [1, 2], "body_nodes": ["step"]}},
                {"id": "step", "type": "action:transform", "config": {"template": 1}},
                {"id": "done", "type": "action:transform", "config": {"template": 2}}
            ]
        }))
        .unwrap();
        assert_eq!(workflow.execution_order(), ["outer"]);
    }

    #[test]
    fn test_owned_conditional_rejected() {
        let err = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "each", "type": "control:loop", "config": {"items": [1], "body_nodes": ["check", "work"]}},
                {"id": "check", "type": "control:if", "config": {"condition": "steps.item > 0"}},
                {"id": "work", "type": "action:transform", "config": {"template": 1}}
            ]
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidNode { node_id, reason } if node_id == "each" && reason.contains("check")
        ));
    }

    #[test]
    fn test_edges_cannot_touch_owned_nodes() {
        let err = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "guard", "type": "control:try", "config": {"try_nodes": ["risky"]}},
                {"id": "risky", "type": "action:transform", "config": {"template": 1}},
                {"id": "later", "type": "action:transform", "config": {"template": 2}}
            ],
            "edges": [{"source": "risky", "target": "later"}]
        }))
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode { node_id, .. } if node_id == "risky"));

        let err = compile(json!({
            "id": "wf",
            "nodes": [
                {"id": "check", "type": "control:if",
                 "config": {"condition": "trigger.ok == true", "true_branch": "risky"}},
                {"id": "guard", "type": "control:try", "config": {"try_nodes": ["risky"]}},
                {"id": "risky", "type": "action:transform", "config": {"template": 1}}
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode { node_id, .. } if node_id == "risky"));
    }
}
