//! Workflow Execution Module
//!
//! Node executors and the engine that runs them against stored records.
//!
//! # Architecture
//!
//! - [`engine`]: Single-record dispatch plus enroll/cancel/skip operations
//! - [`nodes`]: One executor per node type
//! - [`outcome`]: Executor results and their landing rules
//! - [`condition`]: Predicate evaluation and branch selection
//! - [`sender`]: Outbound delivery with idempotency keys
//! - [`contacts`]: Contact data for conditions and tag actions

pub mod condition;
pub mod contacts;
pub mod engine;
pub mod nodes;
pub mod outcome;
pub mod sender;

pub use contacts::{ContactDirectory, ContactProfile, MemoryDirectory};
pub use engine::{Dispatch, Engine, EnrollOptions};
pub use nodes::{executor_for, NodeContext, NodeExecutor};
pub use outcome::Outcome;
pub use sender::{
    DeliveryReceipt, DeliveryRequest, FileOutbox, IdempotencyKey, MemoryOutbox, MessageSender,
};
