//! Definition Validation
//!
//! Checks only what the engine needs to interpret a definition at runtime:
//! - Node and edge reference integrity
//! - A single trigger entry point
//! - Outgoing edges on every non-terminal node
//! - Condition branch partitioning
//! - Node payloads that parse for their type
//!
//! Authoring concerns (layout, unreachable nodes, loops) are left to the editor.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::graph::WorkflowGraph;
use super::model::{Node, NodeKind, WorkflowDefinition};
use crate::error::WorkflowError;

/// Validation error types for operator-friendly messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyNodeId,
    DuplicateNodeId(String),
    NoTrigger,
    MultipleTriggers(Vec<String>),
    DanglingEdge { source: String, target: String },
    MissingOutgoing(String),
    MultipleDefaults(String),
    UnlabelledBranchOnly(String),
    BadData { node: String, message: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no nodes"),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::NoTrigger => write!(f, "Workflow has no trigger node"),
            Self::MultipleTriggers(ids) => {
                write!(f, "Workflow has several entry triggers: {}", ids.join(", "))
            }
            Self::DanglingEdge { source, target } => {
                write!(f, "Edge {} -> {} references an unknown node", source, target)
            }
            Self::MissingOutgoing(node) => {
                write!(f, "Node '{}' is not terminal but has no outgoing edge", node)
            }
            Self::MultipleDefaults(node) => {
                write!(f, "Condition '{}' has more than one default edge", node)
            }
            Self::UnlabelledBranchOnly(node) => write!(
                f,
                "Condition '{}' has several outgoing edges but no branch labels",
                node
            ),
            Self::BadData { node, message } => write!(f, "Node '{}': {}", node, message),
        }
    }
}

/// Checks that a node's payload parses for its type.
fn validate_node_data(node: &Node) -> Option<ValidationError> {
    let result = match node.kind {
        NodeKind::Delay => node.delay_spec().map(|_| ()),
        NodeKind::Action => node.action_spec().map(|_| ()),
        NodeKind::Condition => node.condition_spec().map(|_| ()),
        NodeKind::Trigger | NodeKind::Terminal => Ok(()),
    };

    result.err().map(|e| ValidationError::BadData {
        node: node.id.clone(),
        message: match e {
            WorkflowError::InvalidNodeData { message, .. } => message,
            other => other.to_string(),
        },
    })
}

/// Collects every structural problem in a definition.
pub fn collect_errors(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            errors.push(ValidationError::EmptyNodeId);
            continue;
        }
        if !seen_ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        errors.extend(validate_node_data(node));
    }

    for edge in &definition.edges {
        if !seen_ids.contains(edge.source.as_str()) || !seen_ids.contains(edge.target.as_str()) {
            errors.push(ValidationError::DanglingEdge {
                source: edge.source.clone(),
                target: edge.target.clone(),
            });
        }
    }

    let graph = WorkflowGraph::new(definition);

    let entry_triggers: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Trigger && graph.incoming_edge(&n.id).is_none())
        .map(|n| n.id.clone())
        .collect();

    match entry_triggers.len() {
        0 if graph.entry_node().is_none() => errors.push(ValidationError::NoTrigger),
        0 | 1 => {}
        _ => errors.push(ValidationError::MultipleTriggers(entry_triggers)),
    }

    for node in &definition.nodes {
        let outgoing = graph.outgoing_edges(&node.id);

        if node.kind != NodeKind::Terminal && outgoing.is_empty() {
            errors.push(ValidationError::MissingOutgoing(node.id.clone()));
            continue;
        }

        match node.kind {
            NodeKind::Condition => {
                let defaults = outgoing.iter().filter(|e| e.is_default()).count();
                if defaults > 1 {
                    errors.push(ValidationError::MultipleDefaults(node.id.clone()));
                } else if outgoing.len() > 1 && defaults == outgoing.len() {
                    errors.push(ValidationError::UnlabelledBranchOnly(node.id.clone()));
                }
            }
            NodeKind::Terminal if !outgoing.is_empty() => {
                warn!(
                    "Terminal node '{}' has {} outgoing edges that will never be followed",
                    node.id,
                    outgoing.len()
                );
            }
            NodeKind::Action | NodeKind::Delay | NodeKind::Trigger if outgoing.len() > 1 => {
                warn!(
                    "Node '{}' has {} outgoing edges; only the first is followed",
                    node.id,
                    outgoing.len()
                );
            }
            _ => {}
        }
    }

    errors
}

/// Validates a definition, returning every problem in a single error.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    info!(
        "Validating workflow '{}' v{} with {} nodes and {} edges",
        definition.id,
        definition.version,
        definition.nodes.len(),
        definition.edges.len()
    );

    let errors = collect_errors(definition);
    if errors.is_empty() {
        debug!("Workflow '{}' v{} is valid", definition.id, definition.version);
        return Ok(());
    }

    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(WorkflowError::Invalid(definition.id.clone(), message))
}
