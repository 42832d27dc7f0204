//! Error Types
//!
//! One error enum per concern. Lost optimistic-concurrency races are not
//! errors anywhere in this crate; they surface as
//! [`CasOutcome::Conflict`](crate::store::CasOutcome) and are skipped.

use thiserror::Error;

/// Errors raised while loading, validating, or interpreting a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("workflow '{0}' is invalid: {1}")]
    Invalid(String, String),

    #[error("workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("workflow '{workflow_id}' has no version {version}")]
    UnknownVersion { workflow_id: String, version: u32 },

    #[error("node '{node_id}' not found in workflow '{workflow_id}' v{version}")]
    NodeNotFound {
        workflow_id: String,
        version: u32,
        node_id: String,
    },

    #[error("node '{node_id}' has malformed data: {message}")]
    InvalidNodeData { node_id: String, message: String },

    #[error("node '{node_id}' has no outgoing edge")]
    MissingEdge { node_id: String },

    #[error("workflow '{0}' has no trigger node")]
    NoEntryNode(String),
}

/// Errors raised by an execution record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("execution {0} already exists")]
    Duplicate(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors raised by the outbound message sender.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("outbox I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("outbox entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors raised by the contact directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("contact '{0}' not found")]
    UnknownContact(String),

    #[error("failed to load contacts from '{path}': {message}")]
    Load { path: String, message: String },

    #[error("failed to write contacts to '{path}': {message}")]
    Save { path: String, message: String },

    #[error("contact directory unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by engine-level operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution {0} not found")]
    ExecutionNotFound(String),

    #[error("execution {id} is {status}: {message}")]
    InvalidState {
        id: String,
        status: String,
        message: String,
    },

    #[error("execution {0} changed concurrently; re-read and try again")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a dispatch cycle is already running")]
    CycleInProgress,
}

pub type StoreResult<T> = Result<T, StoreError>;
