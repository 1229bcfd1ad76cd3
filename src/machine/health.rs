//! Node health evaluation for machine lifecycle tracking
//!
//! A node is healthy when `Ready` is True, no disqualifying condition is
//! True, and the critical-components taint is absent. The machine phase
//! follows: Running ↔ Unknown on health flaps, Unknown → Failed once the
//! health timeout lapses.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Node;

use crate::crd::types::CRITICAL_COMPONENTS_NOT_READY_TAINT;

/// True when the given condition type is currently True on the node.
pub fn node_condition_true(node: &Node, condition_type: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
        .unwrap_or(false)
}

/// When the given condition type last transitioned, if it is present.
pub fn condition_transition_time(node: &Node, condition_type: &str) -> Option<DateTime<Utc>> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == condition_type))
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
}

/// True when the node reports Ready and does not carry the
/// critical-components-not-ready taint.
pub fn is_node_ready(node: &Node) -> bool {
    if !node_condition_true(node, "Ready") {
        return false;
    }
    let tainted = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.key == CRITICAL_COMPONENTS_NOT_READY_TAINT)
        })
        .unwrap_or(false);
    !tainted
}

/// Healthy = Ready ∧ no disqualifying condition is True.
pub fn is_node_healthy(node: &Node, disqualifying: &[String]) -> bool {
    if !is_node_ready(node) {
        return false;
    }
    !disqualifying
        .iter()
        .any(|condition| node_condition_true(node, condition))
}

/// Mirror the node's conditions into the machine-status condition format,
/// so `kubectl get machine -o yaml` shows node health without a second
/// lookup.
pub fn mirror_node_conditions(node: &Node) -> Vec<crate::crd::Condition> {
    use crate::crd::{Condition, ConditionStatus};

    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| Condition {
                    type_: c.type_.clone(),
                    status: match c.status.as_str() {
                        "True" => ConditionStatus::True,
                        "False" => ConditionStatus::False,
                        _ => ConditionStatus::Unknown,
                    },
                    reason: c.reason.clone().unwrap_or_default(),
                    message: c.message.clone().unwrap_or_default(),
                    last_transition_time: c
                        .last_transition_time
                        .as_ref()
                        .map(|t| t.0)
                        .unwrap_or_else(Utc::now),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// True when the node has been continuously NotReady or
/// ReadonlyFilesystem for at least `for_minutes` minutes, the trigger for
/// force drain.
pub fn unhealthy_beyond(node: &Node, for_minutes: i64) -> bool {
    let cutoff = Utc::now() - ChronoDuration::minutes(for_minutes);

    let not_ready_long = !node_condition_true(node, "Ready")
        && condition_transition_time(node, "Ready").is_some_and(|t| t < cutoff);

    let readonly_long = node_condition_true(node, "ReadonlyFilesystem")
        && condition_transition_time(node, "ReadonlyFilesystem").is_some_and(|t| t < cutoff);

    not_ready_long || readonly_long
}
