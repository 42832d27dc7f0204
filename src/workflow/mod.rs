//! Workflow Definition Module
//!
//! Provides the graph model the engine interprets: definitions authored
//! elsewhere, loaded from disk, validated for runtime use, and kept per
//! version.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, Node, Edge)
//! - [`graph`]: Read-only lookup view (find node, incoming/outgoing edges)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Runtime validation rules
//! - [`registry`]: Versioned definition catalogue

pub mod graph;
pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use graph::WorkflowGraph;
pub use model::{
    ActionSpec, DelaySpec, DelayUnit, Edge, MessageTemplate, Node, NodeKind, Predicate,
    TimeOperator, WorkflowDefinition,
};
pub use parser::{load_definition, load_registry};
pub use registry::WorkflowRegistry;
