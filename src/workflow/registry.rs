//! Versioned definition registry.
//!
//! Every loaded version of a definition is kept so that in-flight executions
//! can be interpreted against the version they enrolled on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::info;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::WorkflowError;

/// In-memory catalogue of workflow definitions keyed by id and version.
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition, replacing an identical id/version.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(&definition)?;

        info!(
            "Registered workflow '{}' v{} ({} nodes)",
            definition.id,
            definition.version,
            definition.nodes.len()
        );

        self.workflows
            .entry(definition.id.clone())
            .or_default()
            .insert(definition.version, Arc::new(definition));
        Ok(())
    }

    /// Returns a specific version.
    pub fn get(&self, workflow_id: &str, version: u32) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        let versions = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;

        versions
            .get(&version)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownVersion {
                workflow_id: workflow_id.to_string(),
                version,
            })
    }

    /// Returns the highest registered version.
    pub fn latest(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.workflows
            .get(workflow_id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Returns the registered versions of a workflow in ascending order.
    pub fn versions(&self, workflow_id: &str) -> Vec<u32> {
        self.workflows
            .get(workflow_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns registered workflow ids in sorted order.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workflows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Edge, Node};

    fn definition(version: u32) -> WorkflowDefinition {
        WorkflowDefinition::new("welcome")
            .with_version(version)
            .with_node(Node::trigger("start"))
            .with_node(Node::terminal("end"))
            .with_edge(Edge::new("start", "end"))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition(1)).unwrap();
        registry.register(definition(3)).unwrap();

        assert_eq!(registry.get("welcome", 1).unwrap().version, 1);
        assert_eq!(registry.latest("welcome").unwrap().version, 3);
        assert_eq!(registry.versions("welcome"), vec![1, 3]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_lookups() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition(1)).unwrap();

        assert!(matches!(
            registry.get("welcome", 2),
            Err(WorkflowError::UnknownVersion { version: 2, .. })
        ));
        assert!(matches!(
            registry.latest("other"),
            Err(WorkflowError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid() {
        let mut registry = WorkflowRegistry::new();
        let result = registry.register(WorkflowDefinition::new("empty"));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
