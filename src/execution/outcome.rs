//! Executor results and how they land on a record.
//!
//! Landing rules for `Advance`:
//! - onto a delay node with a positive duration: the pointer moves to the
//!   delay and the wait starts now (`wake_at = scheduled_for = now + D`)
//! - onto a terminal node: completed at that node
//! - anywhere else: pending at the target, due at `delay_until` or now

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::store::ExecutionRecord;
use crate::workflow::{NodeKind, WorkflowGraph};

/// What a node executor decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Move the pointer to `next_node_id`
    Advance {
        next_node_id: String,
        delay_until: Option<DateTime<Utc>>,
    },
    /// Stay at the current node until `resume_at`
    Wait { resume_at: DateTime<Utc> },
    /// Complete at the current node
    Finish,
    /// Stop with an error message
    Fail(String),
}

impl Outcome {
    pub fn advance(next_node_id: impl Into<String>) -> Self {
        Self::Advance {
            next_node_id: next_node_id.into(),
            delay_until: None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advance {
                next_node_id,
                delay_until: None,
            } => write!(f, "advance -> {}", next_node_id),
            Self::Advance {
                next_node_id,
                delay_until: Some(at),
            } => write!(f, "advance -> {} at {}", next_node_id, at.to_rfc3339()),
            Self::Wait { resume_at } => write!(f, "wait until {}", resume_at.to_rfc3339()),
            Self::Finish => write!(f, "finish"),
            Self::Fail(message) => write!(f, "fail: {}", message),
        }
    }
}

/// Computes the record that results from `outcome`.
pub fn apply(
    record: &ExecutionRecord,
    outcome: Outcome,
    graph: &WorkflowGraph<'_>,
    now: DateTime<Utc>,
) -> ExecutionRecord {
    match outcome {
        Outcome::Advance {
            next_node_id,
            delay_until,
        } => enter(record, graph, &next_node_id, delay_until, now),
        Outcome::Wait { resume_at } => record.waiting_until(resume_at),
        Outcome::Finish => record.completed_at_node(&record.current_node_id, now),
        Outcome::Fail(message) => record.failed(message, now),
    }
}

/// Moves a record onto `node_id`, applying that node's entry effect.
pub fn enter(
    record: &ExecutionRecord,
    graph: &WorkflowGraph<'_>,
    node_id: &str,
    delay_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ExecutionRecord {
    let Some(node) = graph.find_node(node_id) else {
        return record.pending_at(node_id, delay_until.unwrap_or(now), now);
    };

    match node.kind {
        NodeKind::Terminal if delay_until.is_none() => record.completed_at_node(node_id, now),
        NodeKind::Delay if delay_until.is_none() => {
            let spec = match node.delay_spec() {
                Ok(spec) if spec.duration() > Duration::zero() => spec,
                _ => return record.pending_at(node_id, now, now),
            };
            match spec.resume_at(now) {
                Some(resume_at) => record
                    .pending_at(node_id, resume_at, now)
                    .waiting_until(resume_at),
                None => record.pending_at(node_id, now, now).failed(
                    format!("delay '{}' ends past the supported date range", node_id),
                    now,
                ),
            }
        }
        _ => record.pending_at(node_id, delay_until.unwrap_or(now), now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionStatus;
    use crate::testing::{delay_then_terminal, t0};
    use crate::workflow::{DelayUnit, Edge, Node, WorkflowDefinition};

    fn running_at(node: &str) -> ExecutionRecord {
        ExecutionRecord::enroll("delay-demo", 1, "c1", "c1@example.com", node, t0()).claimed(t0())
    }

    #[test]
    fn test_advance_onto_delay_starts_wait() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let next = apply(&running_at("A"), Outcome::advance("wait"), &graph, t0());

        assert_eq!(next.current_node_id, "wait");
        assert_eq!(next.status, ExecutionStatus::Pending);
        assert_eq!(next.scheduled_for, Some(t0() + Duration::hours(1)));
        assert_eq!(next.wake_at, next.scheduled_for);
        assert_eq!(next.claimed_at, None);
    }

    #[test]
    fn test_advance_onto_terminal_completes() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let now = t0() + Duration::minutes(61);
        let next = apply(&running_at("wait"), Outcome::advance("B"), &graph, now);

        assert_eq!(next.current_node_id, "B");
        assert_eq!(next.status, ExecutionStatus::Completed);
        assert_eq!(next.completed_at, Some(now));
    }

    #[test]
    fn test_advance_onto_zero_delay_is_due_now() {
        let def = WorkflowDefinition::new("w")
            .with_node(Node::trigger("start"))
            .with_node(Node::delay("instant", 0.0, DelayUnit::Minutes))
            .with_node(Node::terminal("end"))
            .with_edge(Edge::new("start", "instant"))
            .with_edge(Edge::new("instant", "end"));
        let graph = WorkflowGraph::new(&def);
        let next = apply(&running_at("start"), Outcome::advance("instant"), &graph, t0());

        assert_eq!(next.current_node_id, "instant");
        assert_eq!(next.scheduled_for, Some(t0()));
        assert_eq!(next.wake_at, None);
    }

    #[test]
    fn test_advance_with_delay_until() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let later = t0() + Duration::hours(3);
        let next = apply(
            &running_at("A"),
            Outcome::Advance {
                next_node_id: "B".to_string(),
                delay_until: Some(later),
            },
            &graph,
            t0(),
        );
        assert_eq!(next.status, ExecutionStatus::Pending);
        assert_eq!(next.scheduled_for, Some(later));
    }

    #[test]
    fn test_advance_onto_delay_past_calendar_end_fails() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::minutes(30);
        let next = apply(&running_at("A"), Outcome::advance("wait"), &graph, near_end);

        assert_eq!(next.status, ExecutionStatus::Failed);
        assert_eq!(next.current_node_id, "wait");
        assert_eq!(next.wake_at, None);
        assert!(next.error_message.unwrap().contains("date range"));
    }

    #[test]
    fn test_wait_keeps_pointer() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let resume_at = t0() + Duration::hours(1);
        let next = apply(&running_at("wait"), Outcome::Wait { resume_at }, &graph, t0());

        assert_eq!(next.current_node_id, "wait");
        assert_eq!(next.scheduled_for, Some(resume_at));
    }

    #[test]
    fn test_fail_records_message() {
        let def = delay_then_terminal();
        let graph = WorkflowGraph::new(&def);
        let next = apply(&running_at("A"), Outcome::Fail("boom".to_string()), &graph, t0());
        assert_eq!(next.status, ExecutionStatus::Failed);
        assert_eq!(next.error_message.as_deref(), Some("boom"));
        assert_eq!(next.current_node_id, "A");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::advance("B").to_string(), "advance -> B");
        assert_eq!(Outcome::Finish.to_string(), "finish");
    }
}
