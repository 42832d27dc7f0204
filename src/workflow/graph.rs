//! Read-only graph view over a definition.
//!
//! Built fresh for each use; definitions are small compared to the number
//! of executions moving through them.

use std::collections::HashMap;

use super::model::{Edge, Node, NodeKind, WorkflowDefinition};

/// Lookup helpers over a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct WorkflowGraph<'a> {
    definition: &'a WorkflowDefinition,
    nodes: HashMap<&'a str, &'a Node>,
}

impl<'a> WorkflowGraph<'a> {
    pub fn new(definition: &'a WorkflowDefinition) -> Self {
        let nodes = definition
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();
        Self { definition, nodes }
    }

    pub fn definition(&self) -> &'a WorkflowDefinition {
        self.definition
    }

    pub fn workflow_id(&self) -> &'a str {
        &self.definition.id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    /// Finds a node by id.
    pub fn find_node(&self, id: &str) -> Option<&'a Node> {
        self.nodes.get(id).copied()
    }

    /// Returns all edges leaving a node, in definition order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&'a Edge> {
        self.definition
            .edges
            .iter()
            .filter(|e| e.source == node_id)
            .collect()
    }

    /// Returns the first edge entering a node.
    ///
    /// Used by repair to reconstruct what precedes a node; graphs authored
    /// by the editor have a single incoming edge per node.
    pub fn incoming_edge(&self, node_id: &str) -> Option<&'a Edge> {
        self.definition.edges.iter().find(|e| e.target == node_id)
    }

    /// Returns the node an incoming edge comes from.
    pub fn predecessor(&self, node_id: &str) -> Option<&'a Node> {
        self.incoming_edge(node_id)
            .and_then(|edge| self.find_node(&edge.source))
    }

    /// Returns the entry trigger: the first trigger node with no incoming edge,
    /// or failing that the first trigger node.
    pub fn entry_node(&self) -> Option<&'a Node> {
        let triggers = || {
            self.definition
                .nodes
                .iter()
                .filter(|n| n.kind == NodeKind::Trigger)
        };
        triggers()
            .find(|n| self.incoming_edge(&n.id).is_none())
            .or_else(|| triggers().next())
    }

    /// Returns the kind of a node, if it exists.
    pub fn kind_of(&self, node_id: &str) -> Option<NodeKind> {
        self.find_node(node_id).map(|n| n.kind)
    }
}
