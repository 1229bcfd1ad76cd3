//! In-place rollout strategy
//!
//! Nodes are updated without replacing machines: an external node agent
//! performs the OS/kubelet change, and this controller coordinates
//! candidacy, drain triggering, ownership transfer and scaling through a
//! label handshake:
//!
//! 1. machines/nodes of old sets are marked `candidate-for-update`;
//! 2. within the availability budget, candidates are promoted to
//!    `selected-for-update` — the agent's trigger to cordon, drain and
//!    update the node;
//! 3. the agent reports `update-result=successful` on the node;
//! 4. the harvest pass rewrites the machine's labels to the new set's
//!    selector and its owner reference to the new set in one atomic patch,
//!    scales the old set down and the new set up (in that order), and
//!    uncordons the node.
//!
//! Old sets are frozen with `skip-update` so they do not replace machines
//! that leave them mid-transfer, and nodes are annotated against
//! cluster-autoscaler scale-down for the duration of the rollout (with a
//! provenance marker so only annotations this controller added are removed
//! afterwards).
//!
//! Availability invariant, held at every step:
//! `available(new) + available(old not selected) ≥ desired − maxUnavailable`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::types::{
    AUTOSCALER_ANNOTATION_VALUE, AUTOSCALER_SCALE_DOWN_DISABLED,
    AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM, LABEL_KEY_CANDIDATE_FOR_UPDATE,
    LABEL_KEY_DRAIN_SUCCESSFUL, LABEL_KEY_SELECTED_FOR_UPDATE, LABEL_KEY_SKIP_UPDATE,
    LABEL_KEY_UPDATE_RESULT, PREFER_NO_SCHEDULE_TAINT, UPDATE_RESULT_FAILED,
    UPDATE_RESULT_SUCCESSFUL,
};
use crate::crd::{Machine, MachineDeployment, MachineSet, MachineSetSelector};
use crate::events::{actions, reasons};
use crate::{Result, API_GROUP_VERSION};

use super::{deployment_complete, scaled_to_zero, total_replicas, Context};

/// One reconcile cycle of the in-place rollout. Every step is idempotent;
/// the cycle is re-entered until the deployment is complete.
pub async fn rollout_in_place(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let rollout_ongoing = !old_sets.is_empty() && !scaled_to_zero(old_sets);

    if let Err(e) = taint_old_nodes(deployment, old_sets, ctx).await {
        // Best effort; a node that cannot be tainted only loses scheduling
        // hints, not correctness.
        warn!(error = %e, "failed to taint nodes backing old machine sets");
    }

    if rollout_ongoing {
        freeze_old_machine_sets(deployment, old_sets, ctx).await?;

        if ctx.settings.autoscaler_scale_down_annotation_during_rollout {
            let all: Vec<&MachineSet> =
                old_sets.iter().chain(std::iter::once(new_set)).collect();
            annotate_nodes_against_scale_down(deployment, &all, ctx).await?;
        }

        mark_update_candidates(deployment, old_sets, ctx).await?;
    }

    sync_machine_sets(deployment, new_set, old_sets, ctx).await?;

    let harvested = harvest_updated_machines(deployment, new_set, old_sets, ctx).await?;
    if harvested {
        return Ok(());
    }

    let active_old: Vec<&MachineSet> =
        old_sets.iter().filter(|ms| ms.spec.replicas > 0).collect();
    let selected = select_machines_for_update(deployment, new_set, &active_old, ctx).await?;
    if selected {
        return Ok(());
    }

    sync_machine_sets(deployment, new_set, old_sets, ctx).await?;

    if deployment_complete(deployment, new_set, old_sets) {
        if ctx.settings.autoscaler_scale_down_annotation_during_rollout {
            let all: Vec<&MachineSet> =
                old_sets.iter().chain(std::iter::once(new_set)).collect();
            remove_autoscaler_annotations(deployment, &all, ctx).await?;
        }
        ctx.events
            .normal(
                &deployment.object_ref(&()),
                reasons::ROLLOUT_COMPLETE,
                actions::ROLLOUT,
                None,
            )
            .await;
    }

    Ok(())
}

/// Rewrite a machine's labels from the old set's selector to the new
/// set's: old-selector-only keys are dropped, new selector labels added,
/// and the update-result marker kept so the sync pass can finish the
/// bookkeeping after a restart.
pub fn rewrite_labels_for_transfer(
    machine_labels: Option<&BTreeMap<String, String>>,
    old_selector: &MachineSetSelector,
    new_selector: &MachineSetSelector,
) -> BTreeMap<String, String> {
    let mut labels = machine_labels.cloned().unwrap_or_default();
    for key in old_selector.match_labels.keys() {
        if !new_selector.match_labels.contains_key(key) {
            labels.remove(key);
        }
    }
    for (key, value) in &new_selector.match_labels {
        labels.insert(key.clone(), value.clone());
    }
    labels.insert(
        LABEL_KEY_UPDATE_RESULT.to_string(),
        UPDATE_RESULT_SUCCESSFUL.to_string(),
    );
    labels
}

/// How many machines may enter the update pipeline right now.
///
/// `all − minAvailable − newUnavailable − alreadyInUpdate`, floored at
/// zero: machines already draining or still unavailable in the new set
/// consume the budget before any new selection.
pub fn max_update_possible(
    all_replicas: i32,
    min_available: i32,
    new_unavailable: i32,
    undergoing_update: i32,
) -> i32 {
    (all_replicas - min_available - new_unavailable - undergoing_update).max(0)
}

/// The node agent's verdict from the update-result label, when present.
fn node_update_result(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_KEY_UPDATE_RESULT))
        .map(String::as_str)
}

/// PreferNoSchedule-taint every node backing an old set, steering new pods
/// toward already-updated capacity.
async fn taint_old_nodes(
    deployment: &MachineDeployment,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    for ms in old_sets {
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        for machine in &machines {
            let Some(node_name) = machine.node_name() else {
                continue;
            };
            let Some(mut node) = ctx.kube.get_node(node_name).await? else {
                continue;
            };
            let taints = node
                .spec
                .get_or_insert_with(Default::default)
                .taints
                .get_or_insert_with(Vec::new);
            if taints.iter().any(|t| t.key == PREFER_NO_SCHEDULE_TAINT) {
                continue;
            }
            taints.push(Taint {
                key: PREFER_NO_SCHEDULE_TAINT.to_string(),
                value: Some("True".to_string()),
                effect: "PreferNoSchedule".to_string(),
                time_added: None,
            });
            ctx.kube.update_node(&node).await?;
        }
    }
    Ok(())
}

/// Label old sets `skip-update` so the MachineSet controller does not
/// scale them back up as machines transfer out.
async fn freeze_old_machine_sets(
    deployment: &MachineDeployment,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    for ms in old_sets {
        if ms.skip_update() {
            continue;
        }
        debug!(set = %ms.name_any(), "freezing old machine set for in-place update");
        ctx.kube
            .merge_machine_set_labels(
                &namespace,
                &ms.name_any(),
                serde_json::json!({ LABEL_KEY_SKIP_UPDATE: "true" }),
            )
            .await?;
    }
    Ok(())
}

/// Annotate every node under the deployment against autoscaler
/// scale-down, with the provenance marker distinguishing our annotation
/// from user-provided ones.
async fn annotate_nodes_against_scale_down(
    deployment: &MachineDeployment,
    sets: &[&MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    for ms in sets {
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        for machine in &machines {
            let Some(node_name) = machine.node_name() else {
                continue;
            };
            let Some(node) = ctx.kube.get_node(node_name).await? else {
                continue;
            };
            let already = node
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM));
            if already {
                continue;
            }
            ctx.kube
                .patch_node(
                    node_name,
                    serde_json::json!({
                        "metadata": {
                            "annotations": {
                                AUTOSCALER_SCALE_DOWN_DISABLED: AUTOSCALER_ANNOTATION_VALUE,
                                AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM: AUTOSCALER_ANNOTATION_VALUE,
                            }
                        }
                    }),
                )
                .await?;
        }
    }
    Ok(())
}

/// Strip the autoscaler annotations this controller added — and only
/// those — once the rollout completes.
async fn remove_autoscaler_annotations(
    deployment: &MachineDeployment,
    sets: &[&MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    for ms in sets {
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        for machine in &machines {
            let Some(node_name) = machine.node_name() else {
                continue;
            };
            let Some(node) = ctx.kube.get_node(node_name).await? else {
                continue;
            };
            let ours = node
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM));
            if !ours {
                continue;
            }
            // null values delete keys under JSON merge patch semantics.
            ctx.kube
                .patch_node(
                    node_name,
                    serde_json::json!({
                        "metadata": {
                            "annotations": {
                                AUTOSCALER_SCALE_DOWN_DISABLED: null,
                                AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM: null,
                            }
                        }
                    }),
                )
                .await?;
        }
    }
    Ok(())
}

/// Mark every machine (and its node) in an old set `candidate-for-update`.
async fn mark_update_candidates(
    deployment: &MachineDeployment,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    for ms in old_sets {
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        for machine in &machines {
            let Some(node_name) = machine.node_name() else {
                continue;
            };
            if !machine.has_label(LABEL_KEY_CANDIDATE_FOR_UPDATE) {
                ctx.kube
                    .patch_machine_metadata(
                        &namespace,
                        &machine.name_any(),
                        serde_json::json!({
                            "labels": { LABEL_KEY_CANDIDATE_FOR_UPDATE: "true" }
                        }),
                    )
                    .await?;
            }

            let Some(mut node) = ctx.kube.get_node(node_name).await? else {
                continue;
            };
            let labels = node.metadata.labels.get_or_insert_with(Default::default);
            if labels.get(LABEL_KEY_CANDIDATE_FOR_UPDATE).map(String::as_str) == Some("true") {
                continue;
            }
            labels.insert(LABEL_KEY_CANDIDATE_FOR_UPDATE.to_string(), "true".to_string());
            ctx.kube.update_node(&node).await?;
        }
    }
    Ok(())
}

/// Repair pass keeping the sets consistent with the machines that actually
/// carry their selectors: transferred machines get their handshake labels
/// stripped and their nodes uncordoned, the new set is scaled up to cover
/// harvested machines, old sets are scaled down to their true counts.
/// This is what finishes an ownership transfer interrupted at any point.
async fn sync_machine_sets(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let namespace = deployment.namespace().unwrap_or_default();
    let machines = ctx
        .machines_matching(&namespace, &new_set.spec.selector)
        .await?;

    let transferred: Vec<&Machine> = machines
        .iter()
        .filter(|m| {
            m.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_KEY_UPDATE_RESULT))
                .map(|v| v == UPDATE_RESULT_SUCCESSFUL)
                .unwrap_or(false)
        })
        .collect();

    if machines.len() as i32 > new_set.spec.replicas && !transferred.is_empty() {
        let scale_up = (transferred.len() as i32)
            .min(machines.len() as i32 - new_set.spec.replicas);
        ctx.scale(deployment, new_set, new_set.spec.replicas + scale_up)
            .await?;
    }

    // Strip the handshake labels from transferred machines.
    for machine in &transferred {
        debug!(machine = %machine.name_any(), "clearing in-place handshake labels");
        ctx.kube
            .patch_machine_metadata(
                &namespace,
                &machine.name_any(),
                serde_json::json!({
                    "labels": {
                        LABEL_KEY_SELECTED_FOR_UPDATE: null,
                        LABEL_KEY_DRAIN_SUCCESSFUL: null,
                        LABEL_KEY_UPDATE_RESULT: null,
                        LABEL_KEY_CANDIDATE_FOR_UPDATE: null,
                    }
                }),
            )
            .await?;
    }

    // Uncordon nodes of machines now in the new set, clearing leftover
    // handshake labels from the node too.
    for machine in &machines {
        let Some(node_name) = machine.node_name() else {
            continue;
        };
        let Some(mut node) = ctx.kube.get_node(node_name).await? else {
            continue;
        };
        let has_handshake_labels = node.metadata.labels.as_ref().is_some_and(|l| {
            l.contains_key(LABEL_KEY_UPDATE_RESULT)
                || l.contains_key(LABEL_KEY_SELECTED_FOR_UPDATE)
                || l.contains_key(LABEL_KEY_CANDIDATE_FOR_UPDATE)
        });
        let cordoned = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if !has_handshake_labels && !cordoned {
            continue;
        }
        if let Some(labels) = node.metadata.labels.as_mut() {
            labels.remove(LABEL_KEY_UPDATE_RESULT);
            labels.remove(LABEL_KEY_SELECTED_FOR_UPDATE);
            labels.remove(LABEL_KEY_CANDIDATE_FOR_UPDATE);
        }
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(false);
        ctx.kube.update_node(&node).await?;
    }

    // Scale old sets down to the machines they still actually hold.
    for ms in old_sets {
        let count = ctx
            .machines_matching(&namespace, &ms.spec.selector)
            .await?
            .len() as i32;
        if count < ms.spec.replicas {
            ctx.scale(deployment, ms, count).await?;
        }
    }

    Ok(())
}

/// Harvest pass: transfer every machine whose node finished its update to
/// the new set. Returns true when any transfer or scale happened, ending
/// the cycle so the next reconcile observes fresh state.
async fn harvest_updated_machines(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<bool> {
    if new_set.spec.replicas == deployment.spec.replicas {
        return Ok(false);
    }
    if new_set.spec.replicas > deployment.spec.replicas {
        return ctx.scale(deployment, new_set, deployment.spec.replicas).await;
    }

    let namespace = deployment.namespace().unwrap_or_default();
    let mut total_transferred = 0;

    for ms in old_sets {
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        let mut transferred_from_set = 0;

        for machine in &machines {
            let Some(node_name) = machine.node_name() else {
                continue;
            };
            let Some(node) = ctx.kube.get_node(node_name).await? else {
                continue;
            };
            match node_update_result(&node) {
                Some(UPDATE_RESULT_SUCCESSFUL) => {}
                Some(UPDATE_RESULT_FAILED) => {
                    // The machine keeps its old set; operators decide
                    // whether to retry the node or replace the machine.
                    warn!(
                        machine = %machine.name_any(),
                        node = %node_name,
                        "node agent reported a failed update, not transferring machine"
                    );
                    ctx.events
                        .warning(
                            &deployment.object_ref(&()),
                            reasons::NODE_UPDATE_FAILED,
                            actions::ROLLOUT,
                            Some(format!(
                                "Node {node_name} failed its in-place update; machine {} stays with {}",
                                machine.name_any(),
                                ms.name_any()
                            )),
                        )
                        .await;
                    continue;
                }
                _ => continue,
            }

            info!(
                machine = %machine.name_any(),
                node = %node_name,
                from = %ms.name_any(),
                to = %new_set.name_any(),
                "transferring machine ownership to new machine set"
            );

            // The atomicity point: labels and the controller owner ref
            // move in one patch, with the uid as precondition. A machine
            // is never owned by both sets or neither.
            let labels = rewrite_labels_for_transfer(
                machine.metadata.labels.as_ref(),
                &ms.spec.selector,
                &new_set.spec.selector,
            );
            let patch = serde_json::json!({
                "ownerReferences": [{
                    "apiVersion": API_GROUP_VERSION,
                    "kind": "MachineSet",
                    "name": new_set.name_any(),
                    "uid": new_set.uid().unwrap_or_default(),
                    "controller": true,
                    "blockOwnerDeletion": true,
                }],
                "labels": labels,
                "uid": machine.uid().unwrap_or_default(),
            });
            ctx.kube
                .patch_machine_metadata(&namespace, &machine.name_any(), patch)
                .await?;
            transferred_from_set += 1;
            total_transferred += 1;

            // Old set shrinks before the new set grows, so total desired
            // never exceeds the fleet under surge 0.
            ctx.scale(
                deployment,
                ms,
                ms.spec.replicas - transferred_from_set,
            )
            .await?;
            ctx.scale(
                deployment,
                new_set,
                new_set.spec.replicas + total_transferred,
            )
            .await?;

            ctx.events
                .normal(
                    &deployment.object_ref(&()),
                    reasons::OWNERSHIP_TRANSFERRED,
                    actions::ROLLOUT,
                    Some(format!(
                        "Machine {} transferred to {}",
                        machine.name_any(),
                        new_set.name_any()
                    )),
                )
                .await;

            // Uncordon failure is not rolled back: the machine stays with
            // the new set and the next sync pass re-discovers the cordoned
            // node and uncordons it.
            let mut node = node;
            node.spec.get_or_insert_with(Default::default).unschedulable = Some(false);
            if let Err(e) = ctx.kube.update_node(&node).await {
                warn!(node = %node_name, error = %e, "uncordon failed after transfer, deferring to next sync");
                return Ok(true);
            }
        }
    }

    Ok(total_transferred > 0)
}

/// Selection pass: promote `candidate-for-update` machines to
/// `selected-for-update` within the availability budget, oldest set first,
/// machines in name order. Returns true when anything was selected.
async fn select_machines_for_update(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    active_old: &[&MachineSet],
    ctx: &Context,
) -> Result<bool> {
    let old_replicas: i32 = active_old.iter().map(|ms| ms.spec.replicas).sum();
    if old_replicas == 0 {
        return Ok(false);
    }

    // With surge headroom the new set may already be at desired; the
    // leftover old machines need no in-place update, just removal.
    if new_set.spec.replicas == deployment.spec.replicas {
        for ms in active_old {
            ctx.scale(deployment, ms, 0).await?;
        }
        return Ok(true);
    }

    let namespace = deployment.namespace().unwrap_or_default();

    let mut undergoing_update = 0;
    for ms in active_old {
        undergoing_update += ctx
            .machines_matching(&namespace, &ms.spec.selector)
            .await?
            .iter()
            .filter(|m| m.has_label(LABEL_KEY_SELECTED_FOR_UPDATE))
            .count() as i32;
    }

    let all: Vec<&MachineSet> = active_old
        .iter()
        .copied()
        .chain(std::iter::once(new_set))
        .collect();
    let all_replicas = total_replicas(&all);
    let min_available = deployment.spec.replicas - deployment.max_unavailable()?;
    let new_unavailable = new_set.spec.replicas - new_set.available_replicas();

    let budget = max_update_possible(
        all_replicas,
        min_available,
        new_unavailable,
        undergoing_update,
    );
    if budget <= 0 {
        debug!(
            all_replicas,
            min_available, new_unavailable, undergoing_update,
            "availability budget exhausted, waiting before selecting more machines"
        );
        return Ok(false);
    }

    let available: i32 = all
        .iter()
        .map(|ms| ms.available_replicas())
        .sum::<i32>()
        - undergoing_update;
    let mut remaining = (available - min_available).min(budget);
    if remaining <= 0 {
        return Ok(false);
    }

    let mut selected_any = false;
    for ms in active_old {
        if remaining <= 0 {
            break;
        }
        let machines = ctx.machines_matching(&namespace, &ms.spec.selector).await?;
        let mut candidates: Vec<&Machine> = machines
            .iter()
            .filter(|m| {
                m.has_label(LABEL_KEY_CANDIDATE_FOR_UPDATE)
                    && !m.has_label(LABEL_KEY_SELECTED_FOR_UPDATE)
            })
            .collect();
        candidates.sort_by_key(|m| m.name_any());
        candidates.truncate(remaining.min(ms.spec.replicas) as usize);

        for machine in candidates {
            info!(machine = %machine.name_any(), "selecting machine for in-place update");
            ctx.kube
                .patch_machine_metadata(
                    &namespace,
                    &machine.name_any(),
                    serde_json::json!({
                        "labels": { LABEL_KEY_SELECTED_FOR_UPDATE: "true" }
                    }),
                )
                .await?;

            if let Some(node_name) = machine.node_name() {
                if let Some(mut node) = ctx.kube.get_node(node_name).await? {
                    let labels =
                        node.metadata.labels.get_or_insert_with(Default::default);
                    if labels.get(LABEL_KEY_SELECTED_FOR_UPDATE).map(String::as_str)
                        != Some("true")
                    {
                        labels.insert(
                            LABEL_KEY_SELECTED_FOR_UPDATE.to_string(),
                            "true".to_string(),
                        );
                        ctx.kube.update_node(&node).await?;
                    }
                }
            }

            ctx.events
                .normal(
                    &deployment.object_ref(&()),
                    reasons::SELECTED_FOR_UPDATE,
                    actions::ROLLOUT,
                    Some(format!("Machine {} selected for update", machine.name_any())),
                )
                .await;

            remaining -= 1;
            selected_any = true;
        }
    }

    Ok(selected_any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{MACHINE_TEMPLATE_HASH_LABEL, NODE_LABEL_KEY};
    use crate::crd::MachineDeploymentStrategyType;
    use crate::deployment::test_support::*;
    use crate::deployment::MockRolloutClient;
    use std::sync::Mutex;

    const NEW_HASH: &str = "newhash";
    const OLD_HASH: &str = "oldhash";

    fn machine_in_set(name: &str, ms: &MachineSet, node: &str) -> Machine {
        let mut labels = ms.spec.selector.match_labels.clone();
        labels.insert(NODE_LABEL_KEY.to_string(), node.to_string());
        let mut machine = Machine::new(
            name,
            crate::crd::MachineSpec {
                class: crate::crd::ClassRef {
                    name: "small".into(),
                },
                provider_id: Some(format!("test:///{name}")),
                configuration: None,
            },
        );
        machine.metadata.namespace = Some("default".into());
        machine.metadata.uid = Some(format!("uid-{name}"));
        machine.metadata.labels = Some(labels);
        machine
    }

    fn node_with_update_result(name: &str, result: Option<&str>) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        if let Some(result) = result {
            node.metadata.labels = Some(BTreeMap::from([(
                LABEL_KEY_UPDATE_RESULT.to_string(),
                result.to_string(),
            )]));
        }
        node
    }

    mod label_rewrite {
        use super::*;

        #[test]
        fn old_only_selector_keys_are_dropped() {
            let old = MachineSetSelector {
                match_labels: BTreeMap::from([
                    ("pool".to_string(), "workers".to_string()),
                    (MACHINE_TEMPLATE_HASH_LABEL.to_string(), OLD_HASH.to_string()),
                ]),
            };
            let new = MachineSetSelector {
                match_labels: BTreeMap::from([
                    ("pool".to_string(), "workers".to_string()),
                    (MACHINE_TEMPLATE_HASH_LABEL.to_string(), NEW_HASH.to_string()),
                ]),
            };
            let machine_labels = BTreeMap::from([
                ("pool".to_string(), "workers".to_string()),
                (MACHINE_TEMPLATE_HASH_LABEL.to_string(), OLD_HASH.to_string()),
                (NODE_LABEL_KEY.to_string(), "node-0".to_string()),
                (LABEL_KEY_CANDIDATE_FOR_UPDATE.to_string(), "true".to_string()),
            ]);

            let rewritten = rewrite_labels_for_transfer(Some(&machine_labels), &old, &new);

            assert_eq!(
                rewritten.get(MACHINE_TEMPLATE_HASH_LABEL),
                Some(&NEW_HASH.to_string())
            );
            // Non-selector labels survive the transfer.
            assert_eq!(rewritten.get(NODE_LABEL_KEY), Some(&"node-0".to_string()));
            assert_eq!(
                rewritten.get(LABEL_KEY_UPDATE_RESULT),
                Some(&UPDATE_RESULT_SUCCESSFUL.to_string())
            );
            assert!(new.matches(Some(&rewritten)));
            assert!(!old.matches(Some(&rewritten)));
        }
    }

    mod budget {
        use super::*;

        #[test]
        fn budget_accounts_for_everything_in_flight() {
            // 3 replicas total, floor 2, one new-set machine unavailable,
            // one machine already draining: nothing may be selected.
            assert_eq!(max_update_possible(3, 2, 1, 1), 0);

            // Same but the new-set machine became available: one slot.
            assert_eq!(max_update_possible(3, 2, 0, 1), 0);
            assert_eq!(max_update_possible(4, 2, 0, 1), 1);
        }

        #[test]
        fn budget_never_goes_negative() {
            assert_eq!(max_update_possible(3, 3, 2, 2), 0);
        }
    }

    mod harvest {
        use super::*;

        /// The happy-path transfer: node-0 finished its update, so its
        /// machine moves to the new set, old scales 3→2 before new scales
        /// 0→1, and the node is uncordoned.
        #[tokio::test]
        async fn successful_node_update_transfers_ownership() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let m0 = machine_in_set("machine-0", &old, "node-0");
            let m1 = machine_in_set("machine-1", &old, "node-1");
            let m2 = machine_in_set("machine-2", &old, "node-2");

            let scale_calls: std::sync::Arc<Mutex<Vec<(String, i32)>>> =
                Default::default();
            let scale_log = scale_calls.clone();

            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(vec![m0.clone(), m1.clone(), m2.clone()]));
            kube.expect_get_node().returning(|name| {
                Ok(Some(node_with_update_result(
                    name,
                    (name == "node-0").then_some(UPDATE_RESULT_SUCCESSFUL),
                )))
            });
            kube.expect_patch_machine_metadata()
                .times(1)
                .withf(|_, name, patch| {
                    name == "machine-0"
                        && patch["ownerReferences"][0]["uid"] == format!("ms-uid-{NEW_HASH}")
                        && patch["labels"][MACHINE_TEMPLATE_HASH_LABEL] == NEW_HASH
                })
                .returning(|_, _, _| Ok(()));
            kube.expect_scale_machine_set()
                .times(2)
                .returning(move |_, name, replicas| {
                    scale_log
                        .lock()
                        .unwrap()
                        .push((name.to_string(), replicas));
                    Ok(())
                });
            kube.expect_update_node()
                .times(1)
                .withf(|node| {
                    node.spec.as_ref().and_then(|s| s.unschedulable) == Some(false)
                })
                .returning(|_| Ok(()));

            let ctx = context(kube);
            let harvested = harvest_updated_machines(&d, &new, &[old], &ctx)
                .await
                .unwrap();
            assert!(harvested);

            // Old scales down before new scales up.
            let calls = scale_calls.lock().unwrap();
            assert_eq!(
                *calls,
                vec![
                    (format!("workers-{OLD_HASH}"), 2),
                    (format!("workers-{NEW_HASH}"), 1),
                ]
            );
        }

        #[tokio::test]
        async fn failed_agent_verdict_leaves_the_machine_in_place() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let m0 = machine_in_set("machine-0", &old, "node-0");
            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(vec![m0.clone()]));
            kube.expect_get_node().returning(|name| {
                Ok(Some(node_with_update_result(
                    name,
                    Some(UPDATE_RESULT_FAILED),
                )))
            });
            // No transfer, no scaling; the verdict only surfaces as a
            // warning event.
            kube.expect_patch_machine_metadata().times(0);
            kube.expect_scale_machine_set().times(0);

            let ctx = context(kube);
            let harvested = harvest_updated_machines(&d, &new, &[old], &ctx)
                .await
                .unwrap();
            assert!(!harvested);
        }

        #[tokio::test]
        async fn nothing_harvested_without_agent_verdicts() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let m0 = machine_in_set("machine-0", &old, "node-0");
            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(vec![m0.clone()]));
            kube.expect_get_node()
                .returning(|name| Ok(Some(node_with_update_result(name, None))));
            kube.expect_patch_machine_metadata().times(0);
            kube.expect_scale_machine_set().times(0);

            let ctx = context(kube);
            let harvested = harvest_updated_machines(&d, &new, &[old], &ctx)
                .await
                .unwrap();
            assert!(!harvested);
        }

        #[tokio::test]
        async fn failed_uncordon_defers_without_reverting_ownership() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let m0 = machine_in_set("machine-0", &old, "node-0");
            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(vec![m0.clone()]));
            kube.expect_get_node().returning(|name| {
                Ok(Some(node_with_update_result(
                    name,
                    Some(UPDATE_RESULT_SUCCESSFUL),
                )))
            });
            // Transfer succeeds...
            kube.expect_patch_machine_metadata()
                .times(1)
                .returning(|_, _, _| Ok(()));
            kube.expect_scale_machine_set()
                .times(2)
                .returning(|_, _, _| Ok(()));
            // ...but the uncordon fails. No reverting patch is issued
            // (patch_machine_metadata stays at one call).
            kube.expect_update_node()
                .times(1)
                .returning(|_| Err(crate::Error::internal("test", "uncordon rejected")));

            let ctx = context(kube);
            let harvested = harvest_updated_machines(&d, &new, &[old], &ctx)
                .await
                .unwrap();
            assert!(harvested);
        }

        #[tokio::test]
        async fn new_set_at_desired_does_not_harvest() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 3, 3, 1);
            let old = machine_set(&d, OLD_HASH, 0, 0, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines().times(0);

            let ctx = context(kube);
            let harvested = harvest_updated_machines(&d, &new, &[old], &ctx)
                .await
                .unwrap();
            assert!(!harvested);
        }
    }

    mod selection {
        use super::*;

        fn candidate_machine(name: &str, ms: &MachineSet, node: &str) -> Machine {
            let mut machine = machine_in_set(name, ms, node);
            machine
                .metadata
                .labels
                .as_mut()
                .unwrap()
                .insert(LABEL_KEY_CANDIDATE_FOR_UPDATE.to_string(), "true".to_string());
            machine
        }

        #[tokio::test]
        async fn selects_up_to_the_availability_budget_in_name_order() {
            // 3 replicas, maxUnavailable=1: exactly one machine may drain.
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let machines = vec![
                candidate_machine("machine-b", &old, "node-b"),
                candidate_machine("machine-a", &old, "node-a"),
                candidate_machine("machine-c", &old, "node-c"),
            ];

            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            // Name order: machine-a wins the single slot.
            kube.expect_patch_machine_metadata()
                .times(1)
                .withf(|_, name, patch| {
                    name == "machine-a" && patch["labels"][LABEL_KEY_SELECTED_FOR_UPDATE] == "true"
                })
                .returning(|_, _, _| Ok(()));
            kube.expect_get_node()
                .returning(|name| Ok(Some(node_with_update_result(name, None))));
            kube.expect_update_node()
                .times(1)
                .withf(|node| {
                    node.metadata
                        .labels
                        .as_ref()
                        .is_some_and(|l| l.get(LABEL_KEY_SELECTED_FOR_UPDATE).map(String::as_str) == Some("true"))
                })
                .returning(|_| Ok(()));

            let ctx = context(kube);
            let selected = select_machines_for_update(&d, &new, &[&old], &ctx)
                .await
                .unwrap();
            assert!(selected);
        }

        #[tokio::test]
        async fn already_selected_machines_consume_the_budget() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            // One machine already draining.
            let mut selected = candidate_machine("machine-a", &old, "node-a");
            selected
                .metadata
                .labels
                .as_mut()
                .unwrap()
                .insert(LABEL_KEY_SELECTED_FOR_UPDATE.to_string(), "true".to_string());
            let machines = vec![
                selected,
                candidate_machine("machine-b", &old, "node-b"),
                candidate_machine("machine-c", &old, "node-c"),
            ];

            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_patch_machine_metadata().times(0);

            let ctx = context(kube);
            let selected = select_machines_for_update(&d, &new, &[&old], &ctx)
                .await
                .unwrap();
            assert!(!selected);
        }

        #[tokio::test]
        async fn surged_new_set_zeroes_leftover_old_sets() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 1, 1);
            let new = machine_set(&d, NEW_HASH, 3, 3, 1);
            let old = machine_set(&d, OLD_HASH, 1, 1, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set()
                .times(1)
                .withf(|_, name, replicas| name == "workers-oldhash" && *replicas == 0)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            let selected = select_machines_for_update(&d, &new, &[&old], &ctx)
                .await
                .unwrap();
            assert!(selected);
        }
    }

    mod full_cycle {
        use super::*;

        /// Steady-state entry: freeze old sets and mark candidates. The
        /// selection pass sees the pre-candidate cache view this cycle and
        /// promotes machines on the next reconcile.
        #[tokio::test]
        async fn first_cycle_freezes_and_marks_candidates() {
            let d = deployment(3, MachineDeploymentStrategyType::InPlaceUpdate, 0, 1);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let machines = vec![
                machine_in_set("machine-0", &old, "node-0"),
                machine_in_set("machine-1", &old, "node-1"),
                machine_in_set("machine-2", &old, "node-2"),
            ];

            let mut kube = MockRolloutClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_get_node()
                .returning(|name| Ok(Some(node_with_update_result(name, None))));
            kube.expect_update_node().returning(|_| Ok(()));
            // Old set frozen.
            kube.expect_merge_machine_set_labels()
                .times(1)
                .withf(|_, name, labels| {
                    name == "workers-oldhash" && labels[LABEL_KEY_SKIP_UPDATE] == "true"
                })
                .returning(|_, _, _| Ok(()));
            // Autoscaler hints on nodes.
            kube.expect_patch_node().returning(|_, _| Ok(()));
            // Candidate marks on the three machines; nothing is selected
            // yet because the listed machines do not carry the candidate
            // label until the next reconcile observes it.
            kube.expect_patch_machine_metadata()
                .times(3)
                .withf(|_, _, patch| patch["labels"][LABEL_KEY_CANDIDATE_FOR_UPDATE] == "true")
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            rollout_in_place(&d, &new, &[old], &ctx).await.unwrap();
        }
    }
}
