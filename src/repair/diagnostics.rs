//! Read-only diagnostics: status counts, position checks, samples, and
//! single-record inspection. Nothing here writes to the store.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use super::drift::{position_of, Position};
use super::RepairDetail;
use crate::error::{EngineError, StoreResult};
use crate::store::{ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStore, RecordQuery};
use crate::workflow::{NodeKind, WorkflowGraph, WorkflowRegistry};

const STATS_PAGE: usize = 500;

/// Aggregate view over stored executions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub total: usize,
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    /// Active records by the kind of node they sit at
    pub by_node_kind: BTreeMap<String, usize>,
    pub pending_due: usize,
    pub pending_future: usize,
    /// Pending records that violate the delay position rule in a repairable way
    pub inconsistent: usize,
    pub inconsistent_samples: Vec<RepairDetail>,
    /// Active records whose pinned version is not loaded
    pub missing_definitions: usize,
}

impl StatsReport {
    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "executions: {}", self.total)?;
        for status in ExecutionStatus::ALL {
            writeln!(f, "  {:<10} {}", status.as_str(), self.count(status))?;
        }
        writeln!(
            f,
            "pending: {} due, {} scheduled later",
            self.pending_due, self.pending_future
        )?;
        for (kind, count) in &self.by_node_kind {
            writeln!(f, "  at {:<10} {}", kind, count)?;
        }
        writeln!(f, "missing definitions: {}", self.missing_definitions)?;
        write!(f, "position inconsistencies: {}", self.inconsistent)?;
        for sample in &self.inconsistent_samples {
            write!(f, "\n  {}", sample)?;
        }
        Ok(())
    }
}

/// Walks every record (optionally of one workflow) and aggregates counts.
pub fn collect_stats(
    store: &dyn ExecutionStore,
    registry: &WorkflowRegistry,
    workflow_id: Option<&str>,
    now: DateTime<Utc>,
    detail_limit: usize,
) -> StoreResult<StatsReport> {
    let mut stats = StatsReport::default();
    let mut cursor: Option<ExecutionId> = None;

    loop {
        let mut query = RecordQuery::new().after(cursor).limit(STATS_PAGE);
        if let Some(id) = workflow_id {
            query = query.with_workflow(id);
        }
        let page = store.scan(&query)?;

        for record in &page {
            stats.total += 1;
            *stats.by_status.entry(record.status).or_insert(0) += 1;
            if !record.status.is_active() {
                continue;
            }

            let definition = registry.get(&record.workflow_id, record.workflow_version).ok();
            let graph = definition.as_deref().map(WorkflowGraph::new);
            let kind = match &graph {
                Some(graph) => graph
                    .kind_of(&record.current_node_id)
                    .map(|k| k.as_str())
                    .unwrap_or("unknown"),
                None => {
                    stats.missing_definitions += 1;
                    "unknown"
                }
            };
            *stats.by_node_kind.entry(kind.to_string()).or_insert(0) += 1;

            if record.status != ExecutionStatus::Pending {
                continue;
            }
            if record.is_due(now) {
                stats.pending_due += 1;
            } else {
                stats.pending_future += 1;
            }

            let position = position_of(record, graph.as_ref(), now);
            if position.is_fixable() {
                stats.inconsistent += 1;
                if stats.inconsistent_samples.len() < detail_limit {
                    stats
                        .inconsistent_samples
                        .push(RepairDetail::new(record, format!("{:?}", position)));
                }
            }
        }

        if page.len() < STATS_PAGE {
            break;
        }
        cursor = page.last().map(|r| r.id);
    }

    Ok(stats)
}

/// Pages through `query` and keeps the first `limit` records under `order`.
/// Memory stays bounded by one page plus `limit`.
fn top_records<F>(
    store: &dyn ExecutionStore,
    query: RecordQuery,
    limit: usize,
    page_size: usize,
    order: F,
) -> StoreResult<Vec<ExecutionRecord>>
where
    F: Fn(&ExecutionRecord, &ExecutionRecord) -> Ordering,
{
    let mut best: Vec<ExecutionRecord> = Vec::new();
    if limit == 0 {
        return Ok(best);
    }
    let mut cursor: Option<ExecutionId> = None;

    loop {
        let page = store.scan(&query.clone().after(cursor).limit(page_size))?;
        cursor = page.last().map(|r| r.id);
        let full = page.len() >= page_size;

        best.extend(page);
        best.sort_by(&order);
        best.truncate(limit);

        if !full {
            break;
        }
    }
    Ok(best)
}

/// Most recent failures first, up to `limit`.
pub fn failed_samples(
    store: &dyn ExecutionStore,
    workflow_id: Option<&str>,
    limit: usize,
) -> StoreResult<Vec<ExecutionRecord>> {
    let mut query = RecordQuery::new().with_status(ExecutionStatus::Failed);
    if let Some(id) = workflow_id {
        query = query.with_workflow(id);
    }
    top_records(store, query, limit, STATS_PAGE, |a, b| {
        b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id))
    })
}

/// Pending records waiting at one node, soonest first.
pub fn waiting_at(
    store: &dyn ExecutionStore,
    workflow_id: &str,
    node_id: &str,
    limit: usize,
) -> StoreResult<Vec<ExecutionRecord>> {
    let query = RecordQuery::new()
        .with_workflow(workflow_id)
        .with_node(node_id)
        .with_status(ExecutionStatus::Pending);
    top_records(store, query, limit, STATS_PAGE, soonest_first)
}

fn soonest_first(a: &ExecutionRecord, b: &ExecutionRecord) -> Ordering {
    a.scheduled_for.cmp(&b.scheduled_for).then(a.id.cmp(&b.id))
}

/// One execution together with what its pinned definition says about it.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub record: ExecutionRecord,
    pub definition_loaded: bool,
    pub node_kind: Option<NodeKind>,
    pub node_label: Option<String>,
    pub next_nodes: Vec<String>,
    pub position: Position,
}

impl fmt::Display for Inspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        writeln!(f, "execution   {}", r.id)?;
        writeln!(f, "workflow    {} v{}", r.workflow_id, r.workflow_version)?;
        writeln!(f, "contact     {} <{}>", r.contact_id, r.recipient)?;
        writeln!(f, "status      {}", r.status)?;
        match (&self.node_label, self.node_kind) {
            (Some(label), Some(kind)) => writeln!(f, "node        {} ({}, {})", r.current_node_id, kind, label)?,
            _ => writeln!(f, "node        {} (not in definition)", r.current_node_id)?,
        }
        if !self.next_nodes.is_empty() {
            writeln!(f, "next        {}", self.next_nodes.join(", "))?;
        }
        if let Some(at) = r.scheduled_for {
            writeln!(f, "scheduled   {}", at.to_rfc3339())?;
        }
        if let Some(at) = r.wake_at {
            writeln!(f, "wake at     {}", at.to_rfc3339())?;
        }
        if let Some(message) = &r.error_message {
            writeln!(f, "error       {}", message)?;
        }
        if !self.definition_loaded {
            writeln!(f, "definition  not loaded")?;
        }
        write!(f, "position    {:?}", self.position)
    }
}

/// Loads one execution and resolves it against its pinned definition.
pub fn inspect(
    store: &dyn ExecutionStore,
    registry: &WorkflowRegistry,
    id: ExecutionId,
    now: DateTime<Utc>,
) -> Result<Inspection, EngineError> {
    let record = store
        .get(id)?
        .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;

    let definition = registry.get(&record.workflow_id, record.workflow_version).ok();
    let graph = definition.as_deref().map(WorkflowGraph::new);
    let node = graph.as_ref().and_then(|g| g.find_node(&record.current_node_id));
    let next_nodes = graph
        .as_ref()
        .map(|g| {
            g.outgoing_edges(&record.current_node_id)
                .into_iter()
                .map(|edge| match &edge.branch {
                    Some(branch) => format!("{} [{}]", edge.target, branch),
                    None => edge.target.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let position = position_of(&record, graph.as_ref(), now);

    Ok(Inspection {
        definition_loaded: graph.is_some(),
        node_kind: node.map(|n| n.kind),
        node_label: node.map(|n| n.label()),
        next_nodes,
        position,
        record,
    })
}
