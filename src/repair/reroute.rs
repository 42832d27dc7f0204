//! Targeted reroute.
//!
//! Moves every pending or running execution of a workflow that sits at one
//! node onto another node, due at a chosen time. Without a source node every
//! pending execution of the workflow is reset onto the target, wherever it
//! currently is; records already there are left alone. Optionally re-pins
//! the moved executions to another definition version, which is how
//! in-flight executions are migrated after an edit that strands them.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::{read_page, RepairDetail, RepairOptions, RepairReport};
use crate::error::{EngineError, WorkflowError};
use crate::store::{CasOutcome, ExecutionRecord, ExecutionStatus, ExecutionStore, RecordQuery};
use crate::workflow::{WorkflowGraph, WorkflowRegistry};

#[derive(Debug, Clone)]
pub struct RerouteRequest {
    pub workflow_id: String,
    /// Only move records at this node; `None` resets every pending record
    pub from_node_id: Option<String>,
    pub to_node_id: String,
    pub scheduled_for: DateTime<Utc>,
    /// Re-pin moved executions to this version
    pub target_version: Option<u32>,
}

impl RerouteRequest {
    fn validate(&self, registry: &WorkflowRegistry) -> Result<(), EngineError> {
        if self.from_node_id.as_deref() == Some(self.to_node_id.as_str()) {
            return Err(EngineError::InvalidRequest(format!(
                "cannot reroute '{}' onto itself",
                self.to_node_id
            )));
        }
        if let Some(version) = self.target_version {
            let definition = registry.get(&self.workflow_id, version)?;
            if WorkflowGraph::new(&definition).find_node(&self.to_node_id).is_none() {
                return Err(WorkflowError::NodeNotFound {
                    workflow_id: self.workflow_id.clone(),
                    version,
                    node_id: self.to_node_id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Moves one batch of executions onto `to_node_id`.
pub fn reroute(
    store: &dyn ExecutionStore,
    registry: &WorkflowRegistry,
    request: &RerouteRequest,
    now: DateTime<Utc>,
    options: &RepairOptions,
) -> Result<RepairReport, EngineError> {
    request.validate(registry)?;
    let mut report = RepairReport::new("reroute", options);

    let query = RecordQuery::new()
        .with_workflow(request.workflow_id.clone())
        .with_status(ExecutionStatus::Pending);
    let query = match &request.from_node_id {
        Some(from) => query
            .with_node(from.clone())
            .with_status(ExecutionStatus::Running),
        None => query,
    };
    let batch = read_page(store, query, options)?;

    for record in &batch {
        if record.current_node_id == request.to_node_id {
            report.already_correct += 1;
            continue;
        }

        let version = request.target_version.unwrap_or(record.workflow_version);
        let target_known = registry
            .get(&record.workflow_id, version)
            .map(|def| WorkflowGraph::new(&def).find_node(&request.to_node_id).is_some())
            .unwrap_or(false);
        if !target_known {
            report.note_skipped(RepairDetail::new(
                record,
                format!("'{}' not in v{}", request.to_node_id, version),
            ));
            continue;
        }

        let note = format!(
            "-> '{}' v{} at {}",
            request.to_node_id,
            version,
            request.scheduled_for.to_rfc3339()
        );
        if options.dry_run {
            report.note_fixed(RepairDetail::new(record, format!("would move {}", note)));
            continue;
        }

        let next = ExecutionRecord {
            workflow_version: version,
            ..record.pending_at(&request.to_node_id, request.scheduled_for, now)
        };
        match store.compare_and_swap(record, next)? {
            CasOutcome::Applied(_) => report.note_fixed(RepairDetail::new(record, note)),
            CasOutcome::Conflict => {
                debug!("Reroute of {} lost to a concurrent write", record.id);
                report.conflicts += 1;
            }
        }
    }

    report.finish_batch(&batch, options.batch_size);
    info!("{}", report);
    Ok(report)
}
