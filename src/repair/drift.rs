//! Position drift detection and repair.
//!
//! A record waiting out a delay must point at the delay node. A pending
//! record with a future schedule that sits on a non-delay node directly
//! after a delay is drifted: it is moved back onto that delay with its
//! schedule preserved as the wake time. A record already on a delay node is
//! correct with or without a wake marker: without one (after a reroute or a
//! reset) the wait simply starts when the record comes due. Anything else
//! with a future schedule is ambiguous and only reported.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::{read_page, RepairDetail, RepairOptions, RepairReport};
use crate::error::StoreResult;
use crate::store::{CasOutcome, ExecutionRecord, ExecutionStatus, ExecutionStore, RecordQuery};
use crate::workflow::{NodeKind, WorkflowGraph, WorkflowRegistry};

/// Where a pending record stands relative to the position rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Position {
    /// Not pending with a future schedule; nothing to check
    NotWaiting,
    /// Waiting on a delay node
    Consistent,
    /// Waiting on the node after `delay_node_id`
    PastDelay { delay_node_id: String },
    /// Cannot be decided from the graph
    Ambiguous(String),
}

impl Position {
    pub fn is_fixable(&self) -> bool {
        matches!(self, Self::PastDelay { .. })
    }
}

/// Classifies a record. `graph` is its pinned definition, if still loaded.
pub fn position_of(
    record: &ExecutionRecord,
    graph: Option<&WorkflowGraph<'_>>,
    now: DateTime<Utc>,
) -> Position {
    if !record.is_scheduled_after(now) {
        return Position::NotWaiting;
    }
    let Some(graph) = graph else {
        return Position::Ambiguous(format!(
            "definition v{} not loaded",
            record.workflow_version
        ));
    };
    let Some(node) = graph.find_node(&record.current_node_id) else {
        return Position::Ambiguous("node not in definition".to_string());
    };

    if node.kind == NodeKind::Delay {
        return Position::Consistent;
    }

    match graph.predecessor(&node.id) {
        None => Position::Ambiguous("no incoming edge".to_string()),
        Some(source) if source.kind == NodeKind::Delay => Position::PastDelay {
            delay_node_id: source.id.clone(),
        },
        Some(source) => Position::Ambiguous(format!("preceded by {} '{}'", source.kind, source.id)),
    }
}

/// Checks one batch of pending records and repairs drifted ones.
pub fn fix_drift(
    store: &dyn ExecutionStore,
    registry: &WorkflowRegistry,
    workflow_id: Option<&str>,
    now: DateTime<Utc>,
    options: &RepairOptions,
) -> StoreResult<RepairReport> {
    let mut report = RepairReport::new("fix-drift", options);

    let mut query = RecordQuery::new().with_status(ExecutionStatus::Pending);
    if let Some(id) = workflow_id {
        query = query.with_workflow(id);
    }
    let batch = read_page(store, query, options)?;

    for record in &batch {
        let definition = registry.get(&record.workflow_id, record.workflow_version).ok();
        let graph = definition.as_deref().map(WorkflowGraph::new);

        let (next, note) = match position_of(record, graph.as_ref(), now) {
            Position::NotWaiting => continue,
            Position::Consistent => {
                report.already_correct += 1;
                continue;
            }
            Position::Ambiguous(reason) => {
                report.note_skipped(RepairDetail::new(record, reason));
                continue;
            }
            Position::PastDelay { delay_node_id } => (
                ExecutionRecord {
                    current_node_id: delay_node_id.clone(),
                    wake_at: record.scheduled_for,
                    ..record.clone()
                },
                format!("move back to delay '{}'", delay_node_id),
            ),
        };

        if options.dry_run {
            report.note_fixed(RepairDetail::new(record, format!("would {}", note)));
            continue;
        }

        match store.compare_and_swap(record, next)? {
            CasOutcome::Applied(_) => report.note_fixed(RepairDetail::new(record, note)),
            CasOutcome::Conflict => {
                debug!("Drift fix for {} lost to a concurrent write", record.id);
                report.conflicts += 1;
            }
        }
    }

    report.finish_batch(&batch, options.batch_size);
    info!("{}", report);
    Ok(report)
}
