//! Scheduler / Dispatcher
//!
//! Periodic dispatch of due executions.
//!
//! - [`dispatcher`]: One bounded, non-overlapping dispatch cycle
//! - [`service`]: Tokio task that runs cycles on an interval until shut down

pub mod dispatcher;
pub mod service;

pub use dispatcher::{CycleReport, Dispatcher, DEFAULT_BATCH_SIZE};
pub use service::{spawn_scheduler, SchedulerConfig, SchedulerTask};
