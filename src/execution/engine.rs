//! Execution Engine
//!
//! Ties the record store, the definition registry, and the external
//! collaborators together. Owns the single-record dispatch step used by the
//! scheduler, and the operator calls that change one execution:
//! - enroll a contact at a workflow's entry trigger
//! - cancel an execution
//! - make a waiting execution due now
//! - force-dispatch one execution

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::contacts::ContactDirectory;
use super::nodes::{executor_for, NodeContext};
use super::outcome::apply;
use super::sender::MessageSender;
use crate::error::{EngineError, WorkflowError};
use crate::store::{
    CasOutcome, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStore, RecordQuery,
};
use crate::workflow::{WorkflowGraph, WorkflowRegistry};

/// Result of dispatching a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The record was not pending when read
    NotDispatchable(ExecutionStatus),
    /// Another writer changed the record before the claim
    LostClaim,
    /// The executor ran and its result was written
    Committed(ExecutionRecord),
    /// The executor ran but the result lost its write; the record stays `running`
    CommitConflict,
}

/// Enrollment options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollOptions {
    /// Allow a second active enrollment of the same contact in the same workflow
    pub allow_reenroll: bool,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chrono::Utc;
/// use dripline::execution::{Engine, EnrollOptions, MemoryDirectory, MemoryOutbox};
/// use dripline::store::MemoryStore;
/// use dripline::workflow::load_registry;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(
///         Arc::new(MemoryStore::new()),
///         Arc::new(load_registry("workflows")?),
///         Arc::new(MemoryOutbox::new()),
///         Arc::new(MemoryDirectory::new()),
///     );
///     let record = engine.enroll("welcome", "c1", "ada@example.com", EnrollOptions::default(), Utc::now())?;
///     println!("{} waiting at {}", record.id, record.current_node_id);
///     Ok(())
/// }
/// ```
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<WorkflowRegistry>,
    sender: Arc<dyn MessageSender>,
    contacts: Arc<dyn ContactDirectory>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<WorkflowRegistry>,
        sender: Arc<dyn MessageSender>,
        contacts: Arc<dyn ContactDirectory>,
    ) -> Self {
        Self {
            store,
            registry,
            sender,
            contacts,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Claims, executes, and commits one record.
    ///
    /// Both writes are conditional: the claim on the pending state that was
    /// read, the commit on the running state the claim produced. Neither is
    /// retried.
    pub fn dispatch_record(
        &self,
        observed: &ExecutionRecord,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, EngineError> {
        if observed.status != ExecutionStatus::Pending {
            return Ok(Dispatch::NotDispatchable(observed.status));
        }

        let claimed = match self.store.compare_and_swap(observed, observed.claimed(now))? {
            CasOutcome::Applied(claimed) => claimed,
            CasOutcome::Conflict => {
                debug!("Lost claim on execution {}", observed.id);
                return Ok(Dispatch::LostClaim);
            }
        };

        let next = self.execute(&claimed, now);

        match self.store.compare_and_swap(&claimed, next)? {
            CasOutcome::Applied(committed) => {
                debug!(
                    "Execution {}: {} -> {} ({})",
                    committed.id, claimed.current_node_id, committed.current_node_id, committed.status
                );
                Ok(Dispatch::Committed(committed))
            }
            CasOutcome::Conflict => {
                warn!(
                    "Commit for execution {} lost to a concurrent write; left for repair",
                    claimed.id
                );
                Ok(Dispatch::CommitConflict)
            }
        }
    }

    /// Runs the executor for a claimed record and returns the record to commit.
    /// Definition errors fail the record instead of propagating.
    fn execute(&self, claimed: &ExecutionRecord, now: DateTime<Utc>) -> ExecutionRecord {
        let definition = match self
            .registry
            .get(&claimed.workflow_id, claimed.workflow_version)
        {
            Ok(definition) => definition,
            Err(e) => {
                warn!("Failing execution {}: {}", claimed.id, e);
                return claimed.failed(e.to_string(), now);
            }
        };
        let graph = WorkflowGraph::new(&definition);

        let Some(node) = graph.find_node(&claimed.current_node_id) else {
            let e = WorkflowError::NodeNotFound {
                workflow_id: claimed.workflow_id.clone(),
                version: claimed.workflow_version,
                node_id: claimed.current_node_id.clone(),
            };
            warn!("Failing execution {}: {}", claimed.id, e);
            return claimed.failed(e.to_string(), now);
        };

        let ctx = NodeContext {
            record: claimed,
            node,
            graph: &graph,
            now,
            sender: self.sender.as_ref(),
            contacts: self.contacts.as_ref(),
        };
        let outcome = executor_for(node.kind).execute(&ctx);
        debug!("Execution {} at {} '{}': {}", claimed.id, node.kind, node.id, outcome);

        apply(claimed, outcome, &graph, now)
    }

    /// Enrolls a contact in the latest version of a workflow and runs the trigger.
    pub fn enroll(
        &self,
        workflow_id: &str,
        contact_id: &str,
        recipient: &str,
        options: EnrollOptions,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, EngineError> {
        let definition = self.registry.latest(workflow_id)?;
        let graph = WorkflowGraph::new(&definition);
        let entry = graph
            .entry_node()
            .ok_or_else(|| WorkflowError::NoEntryNode(workflow_id.to_string()))?;

        if !options.allow_reenroll {
            let active = self.store.scan(
                &RecordQuery::new()
                    .with_workflow(workflow_id)
                    .with_contact(contact_id)
                    .with_status(ExecutionStatus::Pending)
                    .with_status(ExecutionStatus::Running)
                    .limit(1),
            )?;
            if let Some(existing) = active.first() {
                return Err(EngineError::InvalidState {
                    id: existing.id.to_string(),
                    status: existing.status.to_string(),
                    message: format!("contact {} is already enrolled in {}", contact_id, workflow_id),
                });
            }
        }

        let record = ExecutionRecord::enroll(
            workflow_id,
            definition.version,
            contact_id,
            recipient,
            entry.id.clone(),
            now,
        );
        let stored = self.store.insert(record)?;
        info!(
            "Enrolled {} in '{}' v{} as {}",
            contact_id, workflow_id, definition.version, stored.id
        );

        match self.dispatch_record(&stored, now)? {
            Dispatch::Committed(record) => Ok(record),
            _ => Ok(self.store.get(stored.id)?.unwrap_or(stored)),
        }
    }

    fn load(&self, id: ExecutionId) -> Result<ExecutionRecord, EngineError> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    fn invalid_state(record: &ExecutionRecord, message: &str) -> EngineError {
        EngineError::InvalidState {
            id: record.id.to_string(),
            status: record.status.to_string(),
            message: message.to_string(),
        }
    }

    fn write(
        &self,
        observed: &ExecutionRecord,
        next: ExecutionRecord,
    ) -> Result<ExecutionRecord, EngineError> {
        self.store
            .compare_and_swap(observed, next)?
            .into_record()
            .ok_or_else(|| EngineError::Conflict(observed.id.to_string()))
    }

    /// Cancels a pending or running execution. Cancelling twice is a no-op.
    pub fn cancel(&self, id: ExecutionId, now: DateTime<Utc>) -> Result<ExecutionRecord, EngineError> {
        let current = self.load(id)?;
        match current.status {
            ExecutionStatus::Cancelled => Ok(current),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                Err(Self::invalid_state(&current, "cannot cancel a finished execution"))
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                let cancelled = self.write(&current, current.cancelled(now))?;
                info!("Cancelled execution {} at '{}'", id, cancelled.current_node_id);
                Ok(cancelled)
            }
        }
    }

    /// Makes a pending execution due now. A delay wait in progress is marked over.
    pub fn skip_delay(&self, id: ExecutionId, now: DateTime<Utc>) -> Result<ExecutionRecord, EngineError> {
        let current = self.load(id)?;
        if current.status != ExecutionStatus::Pending {
            return Err(Self::invalid_state(&current, "only pending executions can skip ahead"));
        }

        let next = ExecutionRecord {
            scheduled_for: Some(now),
            wake_at: current.wake_at.map(|_| now),
            ..current.clone()
        };
        let updated = self.write(&current, next)?;
        info!("Execution {} at '{}' is now due", id, updated.current_node_id);
        Ok(updated)
    }

    /// Dispatches one pending execution regardless of its schedule.
    pub fn dispatch_now(&self, id: ExecutionId, now: DateTime<Utc>) -> Result<ExecutionRecord, EngineError> {
        let current = self.load(id)?;
        match self.dispatch_record(&current, now)? {
            Dispatch::Committed(record) => Ok(record),
            Dispatch::NotDispatchable(_) => {
                Err(Self::invalid_state(&current, "only pending executions can be dispatched"))
            }
            Dispatch::LostClaim | Dispatch::CommitConflict => {
                Err(EngineError::Conflict(id.to_string()))
            }
        }
    }
}
