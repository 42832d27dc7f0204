//! Shared test fixtures.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::workflow::{DelayUnit, Edge, Node, WorkflowDefinition, WorkflowRegistry};

/// Fixed reference instant.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// `A (trigger) -> wait (1h) -> B (terminal)`
pub fn delay_then_terminal() -> WorkflowDefinition {
    WorkflowDefinition::new("delay-demo")
        .with_node(Node::trigger("A"))
        .with_node(Node::delay("wait", 1.0, DelayUnit::Hours))
        .with_node(Node::terminal("B"))
        .with_edge(Edge::new("A", "wait"))
        .with_edge(Edge::new("wait", "B"))
}

/// `start -> welcome-mail -> tag-vip -> done`
pub fn action_chain() -> WorkflowDefinition {
    WorkflowDefinition::new("chain")
        .with_node(Node::trigger("start"))
        .with_node(Node::send_template("welcome-mail", "tpl_welcome"))
        .with_node(
            Node::new("tag-vip", crate::workflow::NodeKind::Action)
                .with_data(json!({"actionType": "add_tag", "tagId": "vip"})),
        )
        .with_node(Node::terminal("done"))
        .with_edge(Edge::new("start", "welcome-mail"))
        .with_edge(Edge::new("welcome-mail", "tag-vip"))
        .with_edge(Edge::new("tag-vip", "done"))
}

/// `start -> check(opened_email) -yes-> thanks | -no-> nudge`
pub fn opened_fan_out() -> WorkflowDefinition {
    WorkflowDefinition::new("fan")
        .with_node(Node::trigger("start"))
        .with_node(Node::condition("check", "opened_email", json!({})))
        .with_node(Node::terminal("thanks"))
        .with_node(Node::terminal("nudge"))
        .with_edge(Edge::new("start", "check"))
        .with_edge(Edge::new("check", "thanks").with_branch("yes"))
        .with_edge(Edge::new("check", "nudge").with_branch("no"))
}

/// `start -> mail -> wait (2d) -> followup -> done`
pub fn mail_delay_mail() -> WorkflowDefinition {
    WorkflowDefinition::new("nurture")
        .with_node(Node::trigger("start"))
        .with_node(Node::send_template("mail", "tpl_intro"))
        .with_node(Node::delay("wait", 2.0, DelayUnit::Days))
        .with_node(Node::send_template("followup", "tpl_followup"))
        .with_node(Node::terminal("done"))
        .with_edge(Edge::new("start", "mail"))
        .with_edge(Edge::new("mail", "wait"))
        .with_edge(Edge::new("wait", "followup"))
        .with_edge(Edge::new("followup", "done"))
}

/// Registry holding every fixture workflow.
pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    for def in [
        delay_then_terminal(),
        action_chain(),
        opened_fan_out(),
        mail_delay_mail(),
    ] {
        registry.register(def).unwrap();
    }
    registry
}
