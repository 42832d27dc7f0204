//! Execution Records
//!
//! The durable state of one contact's progress through one workflow
//! enrollment. Transition helpers return a new record and never touch
//! `revision`; the store bumps it when a conditional write applies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an execution record. Time-ordered, so id order is enrollment order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle status of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Waiting at `current_node_id` until `scheduled_for`
    Pending,
    /// Claimed by one dispatch attempt
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown execution status '{}'", s))
    }
}

/// One contact's enrollment in one workflow version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,

    pub workflow_id: String,

    /// Definition version this execution is interpreted against
    pub workflow_version: u32,

    pub contact_id: String,

    /// Delivery identity handed to the sender (usually an email address)
    pub recipient: String,

    /// Node the execution is waiting at; never a node already passed
    pub current_node_id: String,

    pub status: ExecutionStatus,

    /// Earliest dispatch time; always set while pending
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Resume time of a delay wait in progress at `current_node_id`
    #[serde(default)]
    pub wake_at: Option<DateTime<Utc>>,

    /// When the pointer last moved to `current_node_id`
    pub node_entered_at: DateTime<Utc>,

    /// When the current dispatch attempt claimed the record
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_message: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Optimistic-concurrency token, bumped by the store on every applied write
    #[serde(default)]
    pub revision: u64,
}

impl ExecutionRecord {
    /// Creates a pending record at the entry node, due immediately.
    pub fn enroll(
        workflow_id: impl Into<String>,
        workflow_version: u32,
        contact_id: impl Into<String>,
        recipient: impl Into<String>,
        entry_node_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id: workflow_id.into(),
            workflow_version,
            contact_id: contact_id.into(),
            recipient: recipient.into(),
            current_node_id: entry_node_id.into(),
            status: ExecutionStatus::Pending,
            scheduled_for: Some(now),
            wake_at: None,
            node_entered_at: now,
            claimed_at: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            revision: 0,
        }
    }

    /// Returns true if the record is pending and its scheduled time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.scheduled_for.map(|at| at <= now).unwrap_or(false)
    }

    /// Returns true if the record is pending with a schedule after `now`.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.scheduled_for.map(|at| at > now).unwrap_or(false)
    }

    /// `pending -> running` for one dispatch attempt.
    pub fn claimed(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Running,
            claimed_at: Some(now),
            ..self.clone()
        }
    }

    /// Pending at `node_id`, due at `scheduled_for`. Moving to another node
    /// resets the entry time and drops any delay wait.
    pub fn pending_at(
        &self,
        node_id: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let moved = node_id != self.current_node_id;
        Self {
            current_node_id: node_id.to_string(),
            status: ExecutionStatus::Pending,
            scheduled_for: Some(scheduled_for),
            wake_at: if moved { None } else { self.wake_at },
            node_entered_at: if moved { now } else { self.node_entered_at },
            claimed_at: None,
            error_message: None,
            completed_at: None,
            ..self.clone()
        }
    }

    /// Pending at the current node until `resume_at`, marked as a delay wait.
    pub fn waiting_until(&self, resume_at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Pending,
            scheduled_for: Some(resume_at),
            wake_at: Some(resume_at),
            claimed_at: None,
            ..self.clone()
        }
    }

    /// Completed at `node_id`.
    pub fn completed_at_node(&self, node_id: &str, now: DateTime<Utc>) -> Self {
        let moved = node_id != self.current_node_id;
        Self {
            current_node_id: node_id.to_string(),
            status: ExecutionStatus::Completed,
            scheduled_for: None,
            wake_at: None,
            node_entered_at: if moved { now } else { self.node_entered_at },
            claimed_at: None,
            completed_at: Some(now),
            ..self.clone()
        }
    }

    /// Failed at the current node with a message.
    pub fn failed(&self, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            scheduled_for: None,
            claimed_at: None,
            error_message: Some(message.into()),
            completed_at: Some(now),
            ..self.clone()
        }
    }

    /// Cancelled by an external actor.
    pub fn cancelled(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            scheduled_for: None,
            wake_at: None,
            claimed_at: None,
            completed_at: Some(now),
            ..self.clone()
        }
    }
}
