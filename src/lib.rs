//! Dripline - Contact Journey Execution Engine
//!
//! Moves contacts through versioned marketing journeys: triggers, message
//! sends, timed delays, condition branches and terminals. Executions are
//! persisted records advanced by a periodic dispatcher under optimistic
//! concurrency, so several dispatchers may share one store without sending
//! a message twice.
//!
//! # Architecture
//!
//! - [`workflow`]: Definition model, loading, validation and versioning
//! - [`store`]: Execution records and the conditional-update store
//! - [`execution`]: Node executors and the single-record engine
//! - [`scheduler`]: Dispatch cycles and the background service
//! - [`repair`]: Re-runnable consistency routines and diagnostics
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use dripline::execution::{Engine, EnrollOptions, FileOutbox, MemoryDirectory};
//! use dripline::scheduler::Dispatcher;
//! use dripline::store::FileStore;
//! use dripline::load_registry;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(
//!         Arc::new(FileStore::open(".dripline/executions.json")),
//!         Arc::new(load_registry("workflows")?),
//!         Arc::new(FileOutbox::open(".dripline/outbox.jsonl")),
//!         Arc::new(MemoryDirectory::new()),
//!     );
//!     engine.enroll("welcome", "c1", "ada@example.com", EnrollOptions::default(), Utc::now())?;
//!
//!     let dispatcher = Dispatcher::new(Arc::new(engine));
//!     let report = dispatcher.run_cycle(Utc::now())?;
//!     println!("{} executions advanced", report.advanced);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod repair;
pub mod scheduler;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, StoreError, WorkflowError};
pub use execution::Engine;
pub use scheduler::Dispatcher;
pub use store::{ExecutionRecord, ExecutionStatus, ExecutionStore};
pub use workflow::{load_definition, load_registry, WorkflowDefinition, WorkflowRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Dripline";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Dripline");
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = WorkflowDefinition::new("welcome");
        assert!(definition.is_empty());
        assert_eq!(definition.version, 1);
    }
}
