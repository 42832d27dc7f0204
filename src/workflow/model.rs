//! Workflow Data Model
//!
//! Core data structures representing a journey definition: typed nodes
//! carrying an opaque `data` payload, and edges between them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: welcome
//! version: 2
//! name: Welcome sequence
//! nodes:
//!   - id: start
//!     type: trigger
//!   - id: wait-1
//!     type: delay
//!     data: { delay: 1, delayUnit: hours }
//!   - id: email-1
//!     type: email
//!     data: { templateId: tpl_welcome }
//!   - id: done
//!     type: stop
//! edges:
//!   - { source: start, target: wait-1 }
//!   - { source: wait-1, target: email-1 }
//!   - { source: email-1, target: done }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::WorkflowError;

/// Branch label taken by a condition that evaluated true.
pub const BRANCH_YES: &str = "yes";

/// Branch label taken by a condition that evaluated false.
pub const BRANCH_NO: &str = "no";

/// Explicit label for the fallback edge of a condition.
pub const BRANCH_DEFAULT: &str = "default";

/// Longest delay a node may declare (100 years).
pub const MAX_DELAY_DAYS: f64 = 36_500.0;

/// The behavior class of a node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Entry point; runs once at enrollment
    Trigger,
    /// Side effect (send a message, tag a contact)
    #[serde(alias = "email")]
    Action,
    /// Wait for a fixed duration
    Delay,
    /// Branch on a predicate over contact data
    Condition,
    /// End of the journey
    #[serde(alias = "stop")]
    Terminal,
}

impl NodeKind {
    /// Returns the lowercase name used in definitions and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single node in a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the definition
    pub id: String,

    /// Node type
    #[serde(rename = "type")]
    pub kind: NodeKind,

    /// Type-specific payload as authored; parsed on demand
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// A directed edge between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub source: String,

    pub target: String,

    /// Branch label for condition fan-out (`yes`, `no`, `default`)
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Edge {
    /// Creates an unlabelled edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    /// Sets the branch label for this edge.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Returns true if this edge is the fallback edge of a condition.
    pub fn is_default(&self) -> bool {
        match self.branch.as_deref() {
            None => true,
            Some(label) => label.eq_ignore_ascii_case(BRANCH_DEFAULT),
        }
    }
}

/// A complete, versioned workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    /// Definition version; executions stay pinned to the version they enrolled against
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Creates an empty definition at version 1.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            name: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Appends a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an edge.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the definition has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Node {
    /// Creates a node with an empty payload.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            kind,
            data: Value::Null,
        }
    }

    /// Creates a trigger node.
    pub fn trigger(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Trigger)
    }

    /// Creates a terminal node.
    pub fn terminal(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Terminal)
    }

    /// Creates a delay node.
    pub fn delay(id: impl Into<String>, value: f64, unit: DelayUnit) -> Self {
        Self::new(id, NodeKind::Delay).with_data(json!({
            "delay": value,
            "delayUnit": unit.as_str(),
        }))
    }

    /// Creates an action node that sends a stored template.
    pub fn send_template(id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Action).with_data(json!({ "templateId": template_id.into() }))
    }

    /// Creates a condition node of the given type with extra payload fields.
    pub fn condition(id: impl Into<String>, condition_type: &str, extra: Value) -> Self {
        let mut data = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        data.insert("conditionType".to_string(), Value::from(condition_type));
        Self::new(id, NodeKind::Condition).with_data(Value::Object(data))
    }

    /// Replaces the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Returns a short human label (`label`, `subject`, or the type).
    pub fn label(&self) -> String {
        self.str_field(&["label", "subject"])
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    fn str_field(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.data.get(*k))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn num_field(&self, keys: &[&str]) -> Result<Option<f64>, WorkflowError> {
        for key in keys {
            match self.data.get(*key) {
                None | Some(Value::Null) => continue,
                Some(Value::Number(n)) => return Ok(n.as_f64()),
                Some(Value::String(s)) => {
                    let parsed = s.trim().parse::<f64>().map_err(|_| self.bad_data(format!(
                        "'{}' must be numeric, got '{}'",
                        key, s
                    )))?;
                    return Ok(Some(parsed));
                }
                Some(other) => {
                    return Err(self.bad_data(format!("'{}' must be numeric, got {}", key, other)))
                }
            }
        }
        Ok(None)
    }

    fn bad_data(&self, message: String) -> WorkflowError {
        WorkflowError::InvalidNodeData {
            node_id: self.id.clone(),
            message,
        }
    }

    /// Parses the payload of a delay node.
    pub fn delay_spec(&self) -> Result<DelaySpec, WorkflowError> {
        let value = self.num_field(&["delay", "delayValue"])?.unwrap_or(1.0);
        if !value.is_finite() || value < 0.0 {
            return Err(self.bad_data(format!("delay must be a non-negative number, got {}", value)));
        }
        let unit = self
            .str_field(&["delayUnit"])
            .map(|u| DelayUnit::parse(&u))
            .unwrap_or(DelayUnit::Days);
        if value * unit.millis() > MAX_DELAY_DAYS * DelayUnit::Days.millis() {
            return Err(self.bad_data(format!(
                "delay of {} {} exceeds {} days",
                value,
                unit.as_str(),
                MAX_DELAY_DAYS
            )));
        }
        Ok(DelaySpec { value, unit })
    }

    /// Parses the payload of an action node.
    pub fn action_spec(&self) -> Result<ActionSpec, WorkflowError> {
        let action_type = self
            .str_field(&["actionType"])
            .unwrap_or_else(|| "send_email".to_string());

        match action_type.as_str() {
            "add_tag" | "remove_tag" => {
                let tag = self
                    .str_field(&["tagId", "tag", "value"])
                    .ok_or_else(|| self.bad_data(format!("{} action has no tag", action_type)))?;
                if action_type == "add_tag" {
                    Ok(ActionSpec::AddTag(tag))
                } else {
                    Ok(ActionSpec::RemoveTag(tag))
                }
            }
            "send_email" | "send" | "email" => {
                if let Some(template_id) = self.str_field(&["templateId"]) {
                    return Ok(ActionSpec::Send(MessageTemplate::Stored { template_id }));
                }
                let subject = self.str_field(&["subject"]);
                let body = self.str_field(&["content", "body"]);
                match (subject, body) {
                    (Some(subject), Some(body)) => {
                        Ok(ActionSpec::Send(MessageTemplate::Inline { subject, body }))
                    }
                    _ => Err(self.bad_data(
                        "send action needs a templateId or both subject and content".to_string(),
                    )),
                }
            }
            other => Err(self.bad_data(format!("unknown actionType '{}'", other))),
        }
    }

    /// Parses the payload of a condition node.
    pub fn condition_spec(&self) -> Result<Predicate, WorkflowError> {
        let Some(condition_type) = self.str_field(&["conditionType"]) else {
            return Ok(Predicate::Always);
        };

        let predicate = match condition_type.as_str() {
            "has_tag" => Predicate::HasTag(
                self.str_field(&["tagId", "tag"])
                    .ok_or_else(|| self.bad_data("has_tag condition has no tagId".to_string()))?,
            ),
            "opened_email" => Predicate::OpenedEmail,
            "clicked_link" => Predicate::ClickedLink(self.str_field(&["linkUrl"])),
            "has_purchased_product" => {
                Predicate::HasPurchased(self.str_field(&["productId", "courseId"]))
            }
            "time_based" => {
                let field = self
                    .str_field(&["timeField"])
                    .unwrap_or_else(|| "subscribedAt".to_string());
                let operator = match self.str_field(&["timeOperator"]).as_deref() {
                    None | Some("greater_than") => TimeOperator::GreaterThan,
                    Some("less_than") => TimeOperator::LessThan,
                    Some("equals") => TimeOperator::Equals,
                    Some(other) => {
                        return Err(self.bad_data(format!("unknown timeOperator '{}'", other)))
                    }
                };
                let days = self.num_field(&["timeDays"])?.unwrap_or(0.0);
                Predicate::TimeSince {
                    field,
                    operator,
                    days,
                }
            }
            other => Predicate::Unknown(other.to_string()),
        };

        Ok(predicate)
    }
}

/// Unit of a delay duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Parses a unit name; anything unrecognised falls back to days.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" => Self::Minutes,
            "hour" | "hours" => Self::Hours,
            _ => Self::Days,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    fn millis(&self) -> f64 {
        match self {
            Self::Minutes => 60_000.0,
            Self::Hours => 3_600_000.0,
            Self::Days => 86_400_000.0,
        }
    }
}

/// Parsed delay payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelaySpec {
    pub value: f64,
    pub unit: DelayUnit,
}

impl DelaySpec {
    /// Returns the wait as a duration, truncated to whole milliseconds.
    pub fn duration(&self) -> Duration {
        Duration::milliseconds((self.value * self.unit.millis()) as i64)
    }

    /// Returns `now` plus the wait, or `None` past the representable calendar.
    pub fn resume_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_add_signed(self.duration())
    }
}

/// Message content referenced by a send action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MessageTemplate {
    Stored { template_id: String },
    Inline { subject: String, body: String },
}

/// Parsed action payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpec {
    Send(MessageTemplate),
    AddTag(String),
    RemoveTag(String),
}

/// Comparison used by time-based conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOperator {
    GreaterThan,
    LessThan,
    Equals,
}

/// Parsed condition payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// No condition configured
    Always,
    HasTag(String),
    OpenedEmail,
    /// Any click, or a click on a link containing the given URL
    ClickedLink(Option<String>),
    /// Any purchase, or a purchase of the given product/course
    HasPurchased(Option<String>),
    /// Days elapsed since a contact timestamp field
    TimeSince {
        field: String,
        operator: TimeOperator,
        days: f64,
    },
    /// Unrecognised condition type
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_aliases() {
        let node: Node = serde_json::from_value(json!({"id": "e1", "type": "email"})).unwrap();
        assert_eq!(node.kind, NodeKind::Action);

        let node: Node = serde_json::from_value(json!({"id": "s", "type": "stop"})).unwrap();
        assert_eq!(node.kind, NodeKind::Terminal);
    }

    #[test]
    fn test_edge_source_handle_alias() {
        let edge: Edge =
            serde_json::from_value(json!({"source": "c", "target": "t", "sourceHandle": "yes"}))
                .unwrap();
        assert_eq!(edge.branch.as_deref(), Some("yes"));
        assert!(!edge.is_default());
        assert!(Edge::new("a", "b").is_default());
        assert!(Edge::new("a", "b").with_branch("Default").is_default());
    }

    #[test]
    fn test_definition_defaults_version() {
        let def: WorkflowDefinition =
            serde_yaml::from_str("id: w\nnodes:\n  - id: t\n    type: trigger\n").unwrap();
        assert_eq!(def.version, 1);
        assert!(def.edges.is_empty());
        assert_eq!(def.len(), 1);
    }

    #[test]
    fn test_delay_spec_units() {
        let node = Node::delay("d", 2.0, DelayUnit::Hours);
        assert_eq!(node.delay_spec().unwrap().duration(), Duration::hours(2));

        let node = Node::new("d", NodeKind::Delay).with_data(json!({"delayValue": "30", "delayUnit": "minutes"}));
        assert_eq!(node.delay_spec().unwrap().duration(), Duration::minutes(30));
    }

    #[test]
    fn test_delay_spec_defaults_to_one_day() {
        let node = Node::new("d", NodeKind::Delay);
        assert_eq!(node.delay_spec().unwrap().duration(), Duration::days(1));

        let node = Node::new("d", NodeKind::Delay).with_data(json!({"delay": 3, "delayUnit": "fortnights"}));
        assert_eq!(node.delay_spec().unwrap().duration(), Duration::days(3));
    }

    #[test]
    fn test_delay_spec_rejects_huge_values() {
        let node = Node::delay("d", 1e9, DelayUnit::Days);
        assert!(matches!(
            node.delay_spec(),
            Err(WorkflowError::InvalidNodeData { .. })
        ));
        assert!(Node::delay("d", MAX_DELAY_DAYS, DelayUnit::Days).delay_spec().is_ok());

        let spec = DelaySpec { value: 1e9, unit: DelayUnit::Days };
        assert_eq!(spec.resume_at(chrono::Utc::now()), None);
    }

    #[test]
    fn test_delay_spec_rejects_negative() {
        let node = Node::new("d", NodeKind::Delay).with_data(json!({"delay": -1}));
        assert!(matches!(
            node.delay_spec(),
            Err(WorkflowError::InvalidNodeData { .. })
        ));
    }

    #[test]
    fn test_action_spec_template_and_inline() {
        let node = Node::send_template("a", "tpl_1");
        assert_eq!(
            node.action_spec().unwrap(),
            ActionSpec::Send(MessageTemplate::Stored {
                template_id: "tpl_1".to_string()
            })
        );

        let node = Node::new("a", NodeKind::Action)
            .with_data(json!({"subject": "Hi", "body": "Hello there"}));
        assert!(matches!(
            node.action_spec().unwrap(),
            ActionSpec::Send(MessageTemplate::Inline { .. })
        ));
    }

    #[test]
    fn test_action_spec_missing_content() {
        let node = Node::new("a", NodeKind::Action).with_data(json!({"subject": "Hi"}));
        assert!(node.action_spec().is_err());
    }

    #[test]
    fn test_action_spec_tags() {
        let node = Node::new("a", NodeKind::Action)
            .with_data(json!({"actionType": "add_tag", "value": "vip"}));
        assert_eq!(node.action_spec().unwrap(), ActionSpec::AddTag("vip".to_string()));

        let node = Node::new("a", NodeKind::Action).with_data(json!({"actionType": "remove_tag"}));
        assert!(node.action_spec().is_err());
    }

    #[test]
    fn test_condition_spec_variants() {
        assert_eq!(
            Node::new("c", NodeKind::Condition).condition_spec().unwrap(),
            Predicate::Always
        );
        assert_eq!(
            Node::condition("c", "has_tag", json!({"tagId": "vip"}))
                .condition_spec()
                .unwrap(),
            Predicate::HasTag("vip".to_string())
        );
        assert_eq!(
            Node::condition("c", "time_based", json!({"timeDays": 7}))
                .condition_spec()
                .unwrap(),
            Predicate::TimeSince {
                field: "subscribedAt".to_string(),
                operator: TimeOperator::GreaterThan,
                days: 7.0,
            }
        );
        assert_eq!(
            Node::condition("c", "lunar_phase", Value::Null)
                .condition_spec()
                .unwrap(),
            Predicate::Unknown("lunar_phase".to_string())
        );
    }

    #[test]
    fn test_node_label() {
        let node = Node::new("a", NodeKind::Action).with_data(json!({"subject": "Welcome!"}));
        assert_eq!(node.label(), "Welcome!");
        assert_eq!(Node::terminal("t").label(), "terminal");
    }
}
