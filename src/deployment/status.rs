//! MachineDeployment status roll-up
//!
//! Recomputes the deployment's status from aggregate MachineSet state on
//! every reconcile: replica counters plus the `Available`, `Progressing`
//! and `ReplicaFailure` conditions.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{
    Condition, ConditionStatus, MachineDeployment, MachineDeploymentStatus, MachineSet,
};
use crate::Result;

use super::Context;

/// Condition type: enough machines are available.
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type: the rollout is making progress.
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Condition type: machine creation is failing.
pub const CONDITION_REPLICA_FAILURE: &str = "ReplicaFailure";

/// True when the rollout has converged: the new set owns the full desired
/// count and every old set is scaled away.
pub fn deployment_complete(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
) -> bool {
    new_set.spec.replicas == deployment.spec.replicas
        && new_set.available_replicas() >= deployment.spec.replicas
        && old_sets.iter().all(|ms| ms.spec.replicas == 0)
}

/// Compute the rolled-up status. Pure; the caller persists it.
pub fn compute_deployment_status(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
) -> MachineDeploymentStatus {
    let all: Vec<&MachineSet> = old_sets.iter().chain(std::iter::once(new_set)).collect();

    let replicas: i32 = all
        .iter()
        .map(|ms| ms.status.as_ref().map(|s| s.replicas).unwrap_or(0))
        .sum();
    let ready_replicas: i32 = all
        .iter()
        .map(|ms| ms.status.as_ref().map(|s| s.ready_replicas).unwrap_or(0))
        .sum();
    let available_replicas: i32 = all.iter().map(|ms| ms.available_replicas()).sum();
    let updated_replicas = new_set
        .status
        .as_ref()
        .map(|s| s.replicas)
        .unwrap_or(0);

    let desired = deployment.spec.replicas;
    let max_unavailable = deployment.max_unavailable().unwrap_or(0);

    let mut conditions = Vec::new();

    // Available: the fleet holds the availability floor.
    let available_now = available_replicas >= desired - max_unavailable;
    conditions.push(carry_transition_time(
        deployment,
        if available_now {
            Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::True,
                "MinimumReplicasAvailable",
                "Deployment has minimum availability",
            )
        } else {
            Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                "MinimumReplicasUnavailable",
                "Deployment does not have minimum availability",
            )
        },
    ));

    // Progressing: complete, still moving, or past the progress deadline.
    let complete = deployment_complete(deployment, new_set, old_sets);
    let progressing = if complete {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "NewMachineSetAvailable",
            format!(
                "MachineSet {} has successfully progressed",
                new_set.name_any()
            ),
        )
    } else if progress_deadline_exceeded(deployment) {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "ProgressDeadlineExceeded",
            format!(
                "MachineSet {} has timed out progressing",
                new_set.name_any()
            ),
        )
    } else {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "MachineSetUpdated",
            format!("MachineSet {} is progressing", new_set.name_any()),
        )
    };
    conditions.push(carry_transition_time(deployment, progressing));

    // ReplicaFailure: any owned set reports machines that failed creation
    // on provider errors.
    let create_failures: Vec<String> = all
        .iter()
        .flat_map(|ms| {
            ms.status
                .iter()
                .flat_map(|s| s.failed_machines.iter())
                .filter(|f| {
                    matches!(
                        f.error_code.as_deref(),
                        Some("Internal") | Some("ResourceExhausted")
                    )
                })
                .map(|f| f.name.clone())
        })
        .collect();
    if !create_failures.is_empty() {
        conditions.push(carry_transition_time(
            deployment,
            Condition::new(
                CONDITION_REPLICA_FAILURE,
                ConditionStatus::True,
                "FailedCreate",
                format!("Machines failed to create: {}", create_failures.join(", ")),
            ),
        ));
    }

    MachineDeploymentStatus {
        observed_generation: deployment.metadata.generation.unwrap_or(0),
        replicas,
        updated_replicas,
        ready_replicas,
        available_replicas,
        unavailable_replicas: (desired - available_replicas).max(0),
        collision_count: deployment.status.as_ref().and_then(|s| s.collision_count),
        conditions,
    }
}

/// Keep the previous transition timestamp when a condition's status and
/// reason are unchanged, so conditions do not churn on every reconcile.
fn carry_transition_time(deployment: &MachineDeployment, condition: Condition) -> Condition {
    let previous = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == condition.type_));
    match previous {
        Some(prev) if prev.status == condition.status && prev.reason == condition.reason => {
            Condition {
                last_transition_time: prev.last_transition_time,
                ..condition
            }
        }
        _ => condition,
    }
}

/// True once the Progressing condition has sat in a non-complete state
/// longer than the configured progress deadline.
fn progress_deadline_exceeded(deployment: &MachineDeployment) -> bool {
    let Some(deadline_seconds) = deployment.spec.progress_deadline_seconds else {
        return false;
    };
    let Some(progressing) = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == CONDITION_PROGRESSING))
    else {
        return false;
    };
    if progressing.reason == "NewMachineSetAvailable" {
        return false;
    }
    (Utc::now() - progressing.last_transition_time).num_seconds() > deadline_seconds as i64
}

/// Recompute and persist the deployment status, skipping the write when
/// nothing changed.
pub async fn sync_rollout_status(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let status = compute_deployment_status(deployment, new_set, old_sets);

    if let Some(current) = deployment.status.as_ref() {
        if *current == status {
            debug!("deployment status unchanged, skipping update");
            return Ok(());
        }
    }

    ctx.kube
        .patch_status(
            &deployment.namespace().unwrap_or_default(),
            &deployment.name_any(),
            &status,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FailedMachineSummary, MachineDeploymentStrategyType};
    use crate::deployment::test_support::*;
    use chrono::Duration as ChronoDuration;

    const NEW_HASH: &str = "newhash";
    const OLD_HASH: &str = "oldhash";

    #[test]
    fn counters_aggregate_across_sets() {
        let d = deployment(5, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let new = machine_set(&d, NEW_HASH, 2, 1, 1);
        let old = machine_set(&d, OLD_HASH, 3, 3, 5);

        let status = compute_deployment_status(&d, &new, &[old]);
        assert_eq!(status.replicas, 5);
        assert_eq!(status.updated_replicas, 2);
        assert_eq!(status.available_replicas, 4);
        assert_eq!(status.unavailable_replicas, 1);
    }

    #[test]
    fn available_condition_follows_the_floor() {
        let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let new = machine_set(&d, NEW_HASH, 3, 3, 1);

        let status = compute_deployment_status(&d, &new, &[]);
        let available = status
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_AVAILABLE)
            .unwrap();
        assert_eq!(available.status, ConditionStatus::True);

        let starving = machine_set(&d, NEW_HASH, 3, 1, 1);
        let status = compute_deployment_status(&d, &starving, &[]);
        let available = status
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_AVAILABLE)
            .unwrap();
        assert_eq!(available.status, ConditionStatus::False);
    }

    #[test]
    fn complete_rollout_reports_new_machine_set_available() {
        let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let new = machine_set(&d, NEW_HASH, 3, 3, 1);
        let old = machine_set(&d, OLD_HASH, 0, 0, 5);

        assert!(deployment_complete(&d, &new, &[old.clone()]));

        let status = compute_deployment_status(&d, &new, &[old]);
        let progressing = status
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_PROGRESSING)
            .unwrap();
        assert_eq!(progressing.reason, "NewMachineSetAvailable");
    }

    #[test]
    fn stalled_rollout_exceeds_the_progress_deadline() {
        let mut d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        d.spec.progress_deadline_seconds = Some(600);
        // Progressing has been stuck for 20 minutes.
        d.status = Some(MachineDeploymentStatus {
            conditions: vec![Condition {
                type_: CONDITION_PROGRESSING.to_string(),
                status: ConditionStatus::True,
                reason: "MachineSetUpdated".to_string(),
                message: String::new(),
                last_transition_time: Utc::now() - ChronoDuration::minutes(20),
            }],
            ..Default::default()
        });
        let new = machine_set(&d, NEW_HASH, 1, 0, 1);
        let old = machine_set(&d, OLD_HASH, 3, 3, 5);

        let status = compute_deployment_status(&d, &new, &[old]);
        let progressing = status
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_PROGRESSING)
            .unwrap();
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "ProgressDeadlineExceeded");
    }

    #[test]
    fn provider_create_failures_raise_replica_failure() {
        let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let mut new = machine_set(&d, NEW_HASH, 3, 2, 1);
        new.status.as_mut().unwrap().failed_machines = vec![FailedMachineSummary {
            name: "workers-newhash-x7k2p".to_string(),
            error_code: Some("ResourceExhausted".to_string()),
            message: "Provider error: quota exceeded".to_string(),
        }];

        let status = compute_deployment_status(&d, &new, &[]);
        let failure = status
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_REPLICA_FAILURE)
            .unwrap();
        assert_eq!(failure.status, ConditionStatus::True);
        assert!(failure.message.contains("workers-newhash-x7k2p"));
    }

    #[test]
    fn user_errors_do_not_raise_replica_failure() {
        let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let mut new = machine_set(&d, NEW_HASH, 3, 2, 1);
        new.status.as_mut().unwrap().failed_machines = vec![FailedMachineSummary {
            name: "workers-newhash-x7k2p".to_string(),
            error_code: None,
            message: "machineClass small not found".to_string(),
        }];

        let status = compute_deployment_status(&d, &new, &[]);
        assert!(!status
            .conditions
            .iter()
            .any(|c| c.type_ == CONDITION_REPLICA_FAILURE));
    }

    #[test]
    fn unchanged_conditions_keep_their_transition_time() {
        let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
        let new = machine_set(&d, NEW_HASH, 3, 3, 1);

        let first = compute_deployment_status(&d, &new, &[]);
        let mut d_with_status = d.clone();
        d_with_status.status = Some(first.clone());

        let second = compute_deployment_status(&d_with_status, &new, &[]);
        let first_available = first
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_AVAILABLE)
            .unwrap();
        let second_available = second
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_AVAILABLE)
            .unwrap();
        assert_eq!(
            first_available.last_transition_time,
            second_available.last_transition_time
        );
    }
}
