//! Node Executors
//!
//! One strategy per node type. An executor looks at the record and its
//! current node and returns an [`Outcome`]; it never writes the record.
//! Waiting nodes keep the pointer on themselves until the wait is over.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use super::condition::{evaluate, select_branch};
use super::contacts::ContactDirectory;
use super::outcome::Outcome;
use super::sender::{DeliveryRequest, IdempotencyKey, MessageSender};
use crate::error::{DirectoryError, WorkflowError};
use crate::store::ExecutionRecord;
use crate::workflow::{ActionSpec, Node, NodeKind, WorkflowGraph};

/// Everything an executor may look at or call.
pub struct NodeContext<'a> {
    pub record: &'a ExecutionRecord,
    pub node: &'a Node,
    pub graph: &'a WorkflowGraph<'a>,
    pub now: DateTime<Utc>,
    pub sender: &'a dyn MessageSender,
    pub contacts: &'a dyn ContactDirectory,
}

impl<'a> NodeContext<'a> {
    /// Target of the node's first outgoing edge.
    fn successor(&self) -> Result<String, WorkflowError> {
        self.graph
            .outgoing_edges(&self.node.id)
            .first()
            .map(|edge| edge.target.clone())
            .ok_or_else(|| WorkflowError::MissingEdge {
                node_id: self.node.id.clone(),
            })
    }

    fn advance_to_successor(&self) -> Outcome {
        match self.successor() {
            Ok(next) => Outcome::advance(next),
            Err(e) => Outcome::Fail(e.to_string()),
        }
    }
}

pub trait NodeExecutor: Send + Sync {
    fn execute(&self, ctx: &NodeContext<'_>) -> Outcome;
}

/// Entry point: moves straight into the graph.
pub struct TriggerExecutor;

impl NodeExecutor for TriggerExecutor {
    fn execute(&self, ctx: &NodeContext<'_>) -> Outcome {
        ctx.advance_to_successor()
    }
}

/// Performs a side effect, then advances.
pub struct ActionExecutor;

impl NodeExecutor for ActionExecutor {
    fn execute(&self, ctx: &NodeContext<'_>) -> Outcome {
        let spec = match ctx.node.action_spec() {
            Ok(spec) => spec,
            Err(e) => return Outcome::Fail(e.to_string()),
        };
        let next = match ctx.successor() {
            Ok(next) => next,
            Err(e) => return Outcome::Fail(e.to_string()),
        };
        let contact_id = &ctx.record.contact_id;

        let result = match spec {
            ActionSpec::Send(template) => {
                if ctx.record.recipient.trim().is_empty() {
                    return Outcome::Fail("execution has no recipient".to_string());
                }
                let request = DeliveryRequest {
                    key: IdempotencyKey::new(ctx.record.id, &ctx.node.id),
                    recipient: ctx.record.recipient.clone(),
                    template,
                    workflow_id: ctx.record.workflow_id.clone(),
                    node_id: ctx.node.id.clone(),
                };
                ctx.sender
                    .deliver(&request)
                    .map(|receipt| {
                        if receipt.duplicate {
                            info!("Message {} already delivered, advancing", receipt.key);
                        }
                    })
                    .map_err(|e| format!("delivery failed: {}", e))
            }
            ActionSpec::AddTag(tag) => ctx
                .contacts
                .add_tag(contact_id, &tag)
                .map(|_| ())
                .map_err(|e| format!("add_tag '{}' failed: {}", tag, e)),
            ActionSpec::RemoveTag(tag) => ctx
                .contacts
                .remove_tag(contact_id, &tag)
                .map(|_| ())
                .map_err(|e| format!("remove_tag '{}' failed: {}", tag, e)),
        };

        match result {
            Ok(()) => Outcome::advance(next),
            Err(message) => Outcome::Fail(message),
        }
    }
}

/// Waits out a fixed duration with the pointer parked on itself.
///
/// `wake_at` tells visits apart: absent means the wait has not started,
/// present and due means time is up, present and future means keep waiting.
pub struct DelayExecutor;

impl NodeExecutor for DelayExecutor {
    fn execute(&self, ctx: &NodeContext<'_>) -> Outcome {
        match ctx.record.wake_at {
            Some(wake_at) if wake_at <= ctx.now => ctx.advance_to_successor(),
            Some(wake_at) => {
                debug!(
                    "Execution {} dispatched before {} at delay '{}'",
                    ctx.record.id, wake_at, ctx.node.id
                );
                Outcome::Wait { resume_at: wake_at }
            }
            None => {
                let spec = match ctx.node.delay_spec() {
                    Ok(spec) => spec,
                    Err(e) => return Outcome::Fail(e.to_string()),
                };
                if spec.duration() <= Duration::zero() {
                    return ctx.advance_to_successor();
                }
                match spec.resume_at(ctx.now) {
                    Some(resume_at) => Outcome::Wait { resume_at },
                    None => Outcome::Fail(format!(
                        "delay '{}' ends past the supported date range",
                        ctx.node.id
                    )),
                }
            }
        }
    }
}

/// Branches on a predicate over contact data.
pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn execute(&self, ctx: &NodeContext<'_>) -> Outcome {
        let predicate = match ctx.node.condition_spec() {
            Ok(predicate) => predicate,
            Err(e) => return Outcome::Fail(e.to_string()),
        };

        let profile = match ctx.contacts.profile(&ctx.record.contact_id) {
            Ok(profile) => Some(profile),
            Err(DirectoryError::UnknownContact(_)) => None,
            Err(e) => return Outcome::Fail(format!("contact lookup failed: {}", e)),
        };

        let result = evaluate(&predicate, profile.as_ref(), ctx.now);
        match select_branch(ctx.graph, &ctx.node.id, result) {
            Ok(edge) => {
                debug!(
                    "Condition '{}' for {} evaluated {}, taking {}",
                    ctx.node.id, ctx.record.id, result, edge.target
                );
                Outcome::advance(edge.target.clone())
            }
            Err(e) => Outcome::Fail(e.to_string()),
        }
    }
}

pub struct TerminalExecutor;

impl NodeExecutor for TerminalExecutor {
    fn execute(&self, _ctx: &NodeContext<'_>) -> Outcome {
        Outcome::Finish
    }
}

/// Returns the executor for a node type.
pub fn executor_for(kind: NodeKind) -> &'static dyn NodeExecutor {
    match kind {
        NodeKind::Trigger => &TriggerExecutor,
        NodeKind::Action => &ActionExecutor,
        NodeKind::Delay => &DelayExecutor,
        NodeKind::Condition => &ConditionExecutor,
        NodeKind::Terminal => &TerminalExecutor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::contacts::{ContactProfile, MemoryDirectory};
    use crate::execution::sender::MemoryOutbox;
    use crate::testing::{action_chain, delay_then_terminal, opened_fan_out, t0};
    use crate::workflow::WorkflowDefinition;
    use serde_json::json;

    struct Harness {
        outbox: MemoryOutbox,
        contacts: MemoryDirectory,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                outbox: MemoryOutbox::new(),
                contacts: MemoryDirectory::with_contacts([ContactProfile::new("c1")]),
            }
        }

        fn run(
            &self,
            def: &WorkflowDefinition,
            record: &ExecutionRecord,
            now: DateTime<Utc>,
        ) -> Outcome {
            let graph = WorkflowGraph::new(def);
            let node = graph.find_node(&record.current_node_id).unwrap();
            let ctx = NodeContext {
                record,
                node,
                graph: &graph,
                now,
                sender: &self.outbox,
                contacts: &self.contacts,
            };
            executor_for(node.kind).execute(&ctx)
        }
    }

    fn at(def: &WorkflowDefinition, node: &str) -> ExecutionRecord {
        ExecutionRecord::enroll(def.id.clone(), def.version, "c1", "c1@example.com", node, t0())
    }

    #[test]
    fn test_trigger_advances() {
        let def = delay_then_terminal();
        assert_eq!(Harness::new().run(&def, &at(&def, "A"), t0()), Outcome::advance("wait"));
    }

    #[test]
    fn test_terminal_finishes() {
        let def = delay_then_terminal();
        assert_eq!(Harness::new().run(&def, &at(&def, "B"), t0()), Outcome::Finish);
    }

    #[test]
    fn test_delay_first_visit_waits() {
        let def = delay_then_terminal();
        let outcome = Harness::new().run(&def, &at(&def, "wait"), t0());
        assert_eq!(
            outcome,
            Outcome::Wait {
                resume_at: t0() + Duration::hours(1)
            }
        );
    }

    #[test]
    fn test_delay_past_calendar_end_fails() {
        let def = delay_then_terminal();
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::minutes(30);
        assert!(matches!(
            Harness::new().run(&def, &at(&def, "wait"), near_end),
            Outcome::Fail(message) if message.contains("date range")
        ));
    }

    #[test]
    fn test_delay_early_dispatch_keeps_waiting() {
        let def = delay_then_terminal();
        let resume_at = t0() + Duration::hours(1);
        let record = at(&def, "wait").waiting_until(resume_at);
        let outcome = Harness::new().run(&def, &record, t0() + Duration::minutes(30));
        assert_eq!(outcome, Outcome::Wait { resume_at });
    }

    #[test]
    fn test_delay_due_advances() {
        let def = delay_then_terminal();
        let resume_at = t0() + Duration::hours(1);
        let record = at(&def, "wait").waiting_until(resume_at);
        assert_eq!(
            Harness::new().run(&def, &record, resume_at),
            Outcome::advance("B")
        );
    }

    #[test]
    fn test_action_sends_once_per_key() {
        let def = action_chain();
        let harness = Harness::new();
        let record = at(&def, "welcome-mail");

        assert_eq!(harness.run(&def, &record, t0()), Outcome::advance("tag-vip"));
        assert_eq!(harness.run(&def, &record, t0()), Outcome::advance("tag-vip"));

        let delivered = harness.outbox.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].key, IdempotencyKey::new(record.id, "welcome-mail"));
        assert_eq!(harness.outbox.attempts(), 2);
    }

    #[test]
    fn test_action_sender_failure_fails() {
        let def = action_chain();
        let harness = Harness::new();
        harness.outbox.reject_recipient("c1@example.com");
        assert!(matches!(
            harness.run(&def, &at(&def, "welcome-mail"), t0()),
            Outcome::Fail(message) if message.starts_with("delivery failed")
        ));
    }

    #[test]
    fn test_action_tags_contact() {
        let def = action_chain();
        let harness = Harness::new();
        assert_eq!(
            harness.run(&def, &at(&def, "tag-vip"), t0()),
            Outcome::advance("done")
        );
        assert!(harness.contacts.profile("c1").unwrap().tags.contains("vip"));
    }

    #[test]
    fn test_action_unknown_contact_tag_fails() {
        let def = action_chain();
        let harness = Harness::new();
        let record = ExecutionRecord::enroll("chain", 1, "ghost", "g@example.com", "tag-vip", t0());
        assert!(matches!(harness.run(&def, &record, t0()), Outcome::Fail(_)));
    }

    #[test]
    fn test_condition_branches() {
        let def = opened_fan_out();
        let harness = Harness::new();
        assert_eq!(
            harness.run(&def, &at(&def, "check"), t0()),
            Outcome::advance("nudge")
        );

        harness
            .contacts
            .upsert(ContactProfile::new("c1").with_opens(2))
            .unwrap();
        assert_eq!(
            harness.run(&def, &at(&def, "check"), t0()),
            Outcome::advance("thanks")
        );
    }

    #[test]
    fn test_bad_node_data_fails() {
        let def = WorkflowDefinition::new("w")
            .with_node(Node::new("wait", NodeKind::Delay).with_data(json!({"delay": "soon"})))
            .with_node(Node::terminal("end"))
            .with_edge(crate::workflow::Edge::new("wait", "end"));
        assert!(matches!(
            Harness::new().run(&def, &at(&def, "wait"), t0()),
            Outcome::Fail(_)
        ));
    }
}
