//! Definition Parser
//!
//! Loads workflow definitions exported by the authoring surface. Files may be
//! YAML or JSON; JSON is read through the YAML parser since it is a subset.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use super::model::WorkflowDefinition;
use super::registry::WorkflowRegistry;
use super::validator::validate_definition;
use crate::error::WorkflowError;

/// File extensions picked up when loading a directory of definitions.
const DEFINITION_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Parses a definition from YAML or JSON text.
pub fn parse_definition(content: &str, origin: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let definition: WorkflowDefinition =
        serde_yaml::from_str(content).map_err(|e| WorkflowError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

    debug!(
        "Parsed workflow '{}' v{}: {} nodes, {} edges",
        definition.id,
        definition.version,
        definition.nodes.len(),
        definition.edges.len()
    );

    Ok(definition)
}

/// Loads and validates a single definition file.
///
/// # Example
///
/// ```rust,no_run
/// use dripline::workflow::parser::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("workflows/welcome.yaml")?;
///     println!("Loaded {} nodes", definition.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition, WorkflowError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    info!("Loading workflow from: {}", origin);

    let content = fs::read_to_string(path).map_err(|source| WorkflowError::Read {
        path: origin.clone(),
        source,
    })?;

    let definition = parse_definition(&content, &origin)?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Loads every definition file in a directory into a registry.
///
/// Files that fail to parse or validate are skipped with a warning so one
/// broken export does not stop the scheduler from serving the rest.
pub fn load_registry(dir: impl AsRef<Path>) -> Result<WorkflowRegistry, WorkflowError> {
    let dir = dir.as_ref();
    let mut registry = WorkflowRegistry::new();

    let entries = fs::read_dir(dir).map_err(|source| WorkflowError::Read {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| DEFINITION_EXTENSIONS.contains(&e))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_definition(&path).and_then(|def| registry.register(def)) {
            Ok(()) => {}
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }

    info!(
        "Loaded {} workflow versions from {}",
        registry.len(),
        dir.display()
    );
    Ok(registry)
}

/// Writes a definition as YAML.
pub fn save_definition(
    definition: &WorkflowDefinition,
    path: impl AsRef<Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let yaml_content = serde_yaml::to_string(definition)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Saved workflow '{}' to {}", definition.id, path.as_ref().display());
    Ok(())
}
