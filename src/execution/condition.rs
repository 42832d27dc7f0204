//! Condition predicates and branch selection.

use chrono::{DateTime, Utc};
use log::warn;

use super::contacts::ContactProfile;
use crate::error::WorkflowError;
use crate::workflow::model::{BRANCH_NO, BRANCH_YES};
use crate::workflow::{Edge, Predicate, TimeOperator, WorkflowGraph};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Evaluates a predicate. A missing contact fails every data-dependent predicate.
pub fn evaluate(predicate: &Predicate, contact: Option<&ContactProfile>, now: DateTime<Utc>) -> bool {
    let contact = match (predicate, contact) {
        (Predicate::Always, _) => return true,
        (Predicate::Unknown(kind), _) => {
            warn!("Unknown condition type '{}', taking the yes branch", kind);
            return true;
        }
        (_, None) => return false,
        (_, Some(contact)) => contact,
    };

    match predicate {
        Predicate::HasTag(tag) => contact.tags.contains(tag),
        Predicate::OpenedEmail => contact.opened_count > 0,
        Predicate::ClickedLink(None) => !contact.clicked_links.is_empty(),
        Predicate::ClickedLink(Some(url)) => {
            contact.clicked_links.iter().any(|link| link.contains(url.as_str()))
        }
        Predicate::HasPurchased(None) => !contact.purchased.is_empty(),
        Predicate::HasPurchased(Some(product)) => contact.purchased.contains(product),
        Predicate::TimeSince {
            field,
            operator,
            days,
        } => {
            let Some(at) = contact.timestamps.get(field) else {
                return false;
            };
            let elapsed = (now - *at).num_milliseconds() as f64 / MILLIS_PER_DAY;
            match operator {
                TimeOperator::GreaterThan => elapsed > *days,
                TimeOperator::LessThan => elapsed < *days,
                TimeOperator::Equals => elapsed.floor() == *days,
            }
        }
        Predicate::Always | Predicate::Unknown(_) => true,
    }
}

fn branch_matches(edge: &Edge, result: bool) -> bool {
    let Some(label) = edge.branch.as_deref() else {
        return false;
    };
    let wanted: [&str; 2] = if result {
        [BRANCH_YES, "true"]
    } else {
        [BRANCH_NO, "false"]
    };
    wanted.iter().any(|w| label.eq_ignore_ascii_case(w))
}

/// Picks the outgoing edge for a condition result: the matching labelled
/// branch, otherwise the default edge.
pub fn select_branch<'a>(
    graph: &WorkflowGraph<'a>,
    node_id: &str,
    result: bool,
) -> Result<&'a Edge, WorkflowError> {
    let outgoing = graph.outgoing_edges(node_id);

    outgoing
        .iter()
        .find(|e| branch_matches(e, result))
        .or_else(|| outgoing.iter().find(|e| e.is_default()))
        .copied()
        .ok_or_else(|| WorkflowError::MissingEdge {
            node_id: node_id.to_string(),
        })
}
