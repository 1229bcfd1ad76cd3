//! Recreate and RollingUpdate rollout strategies
//!
//! Recreate scales every old set to zero and only then brings the new set
//! up. RollingUpdate runs the classic surge-then-shrink loop: the new set
//! surges up to `desired + maxSurge` total machines, old sets shrink as
//! availability allows, and at no point may availability drop below
//! `desired − maxUnavailable`.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{MachineDeployment, MachineSet};
use crate::Result;

use super::{total_available, total_replicas, Context};

/// Recreate: old sets to zero first, then the new set to desired.
pub async fn rollout_recreate(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let mut any_scaled = false;
    for ms in old_sets {
        any_scaled |= ctx.scale(deployment, ms, 0).await?;
    }
    if any_scaled {
        return Ok(());
    }

    // Old machines must actually be gone, not merely descaled, before the
    // replacement fleet comes up.
    let old_machines_remaining: i32 = old_sets
        .iter()
        .map(|ms| ms.status.as_ref().map(|s| s.replicas).unwrap_or(0))
        .sum();
    if old_machines_remaining > 0 {
        debug!(remaining = old_machines_remaining, "waiting for old machines to terminate");
        return Ok(());
    }

    ctx.scale(deployment, new_set, deployment.spec.replicas)
        .await?;
    Ok(())
}

/// RollingUpdate: surge the new set, then shrink the old sets within the
/// availability budget. Each reconcile performs at most one of the two
/// motions; the next reconcile observes the result and continues.
pub async fn rollout_rolling(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let scaled_up = reconcile_new_machine_set(deployment, new_set, old_sets, ctx).await?;
    if scaled_up {
        return Ok(());
    }

    reconcile_old_machine_sets(deployment, new_set, old_sets, ctx).await?;
    Ok(())
}

/// Desired replicas for the new set this cycle: grow toward `desired`
/// while total machines stay within `desired + maxSurge`.
pub fn new_set_target(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    max_surge: i32,
) -> i32 {
    let desired = deployment.spec.replicas;
    if new_set.spec.replicas == desired {
        return desired;
    }
    if new_set.spec.replicas > desired {
        return desired;
    }

    let all: Vec<&MachineSet> = old_sets.iter().chain(std::iter::once(new_set)).collect();
    let current_total = total_replicas(&all);
    let max_total = desired + max_surge;
    if current_total >= max_total {
        // Surge exhausted; wait for old sets to shrink.
        return new_set.spec.replicas;
    }
    let scale_up = (max_total - current_total).min(desired - new_set.spec.replicas);
    new_set.spec.replicas + scale_up
}

/// Scale the new set toward desired within the surge budget. Returns true
/// when a scale happened.
async fn reconcile_new_machine_set(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<bool> {
    let max_surge = deployment.max_surge()?;
    let target = new_set_target(deployment, new_set, old_sets, max_surge);
    ctx.scale(deployment, new_set, target).await
}

/// How many old-set replicas may be removed this cycle without violating
/// the availability budget. Mirrors the two-phase shrink: unavailable old
/// machines go first (they cost nothing), then available ones down to
/// `minAvailable`.
pub fn old_sets_scale_down_budget(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    max_unavailable: i32,
) -> i32 {
    let old: Vec<&MachineSet> = old_sets.iter().collect();
    let old_replicas = total_replicas(&old);
    if old_replicas == 0 {
        return 0;
    }

    let all: Vec<&MachineSet> = old_sets.iter().chain(std::iter::once(new_set)).collect();
    let all_replicas = total_replicas(&all);
    let min_available = deployment.spec.replicas - max_unavailable;
    let new_unavailable = new_set.spec.replicas - new_set.available_replicas();

    (all_replicas - min_available - new_unavailable).max(0)
}

/// Shrink old sets oldest-first within the budget. Returns the number of
/// replicas removed.
async fn reconcile_old_machine_sets(
    deployment: &MachineDeployment,
    new_set: &MachineSet,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<i32> {
    let max_unavailable = deployment.max_unavailable()?;
    let mut budget = old_sets_scale_down_budget(deployment, new_set, old_sets, max_unavailable);
    if budget <= 0 {
        debug!("availability budget exhausted, not shrinking old sets");
        return Ok(0);
    }

    // Phase one: drop replicas that are not available anyway. Cuts are
    // tracked per set so phase two works from the post-cut counts.
    let mut cuts: std::collections::HashMap<String, i32> = std::collections::HashMap::new();
    let mut scaled_down = 0;
    for ms in old_sets {
        if budget <= 0 {
            break;
        }
        let unhealthy = (ms.spec.replicas - ms.available_replicas()).max(0);
        let cut = unhealthy.min(budget);
        if cut > 0 {
            ctx.scale(deployment, ms, ms.spec.replicas - cut).await?;
            cuts.insert(ms.name_any(), cut);
            scaled_down += cut;
            budget -= cut;
        }
    }

    // Phase two: shrink available capacity down to the floor, oldest set
    // first.
    let all: Vec<&MachineSet> = old_sets.iter().chain(std::iter::once(new_set)).collect();
    let min_available = deployment.spec.replicas - max_unavailable;
    let mut removable = (total_available(&all) - min_available).max(0).min(budget);
    for ms in old_sets {
        if removable <= 0 {
            break;
        }
        let current = ms.spec.replicas - cuts.get(&ms.name_any()).copied().unwrap_or(0);
        let cut = current.min(removable);
        if cut > 0 {
            ctx.scale(deployment, ms, current - cut).await?;
            scaled_down += cut;
            removable -= cut;
        }
    }

    if scaled_down > 0 {
        info!(scaled_down, "shrunk old machine sets");
    }
    Ok(scaled_down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MachineDeploymentStrategyType;
    use crate::deployment::test_support::*;
    use crate::deployment::MockRolloutClient;

    const NEW_HASH: &str = "newhash";
    const OLD_HASH: &str = "oldhash";

    mod surge_math {
        use super::*;

        #[test]
        fn surge_allows_the_new_set_above_zero_while_old_is_full() {
            // replicas=3, surge=1, unavailable=0: classic one-at-a-time.
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            // Total 3 < maxTotal 4: one new machine may surge.
            assert_eq!(new_set_target(&d, &new, &[old], 1), 1);
        }

        #[test]
        fn surge_exhausted_blocks_scale_up() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 1, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            // Total 4 == maxTotal 4: hold.
            assert_eq!(new_set_target(&d, &new, &[old], 1), 1);
        }

        #[test]
        fn new_set_never_exceeds_desired() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 5, 0);
            let new = machine_set(&d, NEW_HASH, 2, 2, 1);
            let old = machine_set(&d, OLD_HASH, 0, 0, 5);

            // Plenty of surge headroom, but the cap is desired.
            assert_eq!(new_set_target(&d, &new, &[old], 5), 3);
        }

        #[test]
        fn overscaled_new_set_shrinks_to_desired() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 5, 5, 1);
            assert_eq!(new_set_target(&d, &new, &[], 1), 3);
        }
    }

    mod shrink_math {
        use super::*;

        #[test]
        fn no_old_replicas_means_no_budget() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 3, 3, 1);
            let old = machine_set(&d, OLD_HASH, 0, 0, 5);
            assert_eq!(old_sets_scale_down_budget(&d, &new, &[old], 0), 0);
        }

        #[test]
        fn unavailable_new_machines_consume_the_budget() {
            // replicas=3, maxUnavailable=1. New set surged to 1 but the
            // machine is not available yet: removing an old machine would
            // break the floor.
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 1);
            let new = machine_set(&d, NEW_HASH, 1, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            // all=4, minAvailable=2, newUnavailable=1 → budget 1.
            assert_eq!(old_sets_scale_down_budget(&d, &new, &[old], 1), 1);
        }

        #[test]
        fn available_new_machines_free_the_budget() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 1, 1, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            // all=4, minAvailable=3, newUnavailable=0 → budget 1.
            assert_eq!(old_sets_scale_down_budget(&d, &new, &[old], 0), 1);
        }
    }

    mod recreate {
        use super::*;

        #[tokio::test]
        async fn old_sets_are_zeroed_before_new_comes_up() {
            let d = deployment(3, MachineDeploymentStrategyType::Recreate, 0, 0);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set()
                .times(1)
                .withf(|_, name, replicas| name == "workers-oldhash" && *replicas == 0)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            rollout_recreate(&d, &new, &[old], &ctx).await.unwrap();
        }

        #[tokio::test]
        async fn new_set_waits_for_old_machines_to_terminate() {
            let d = deployment(3, MachineDeploymentStrategyType::Recreate, 0, 0);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            // Old set descaled but machines still draining.
            let mut old = machine_set(&d, OLD_HASH, 0, 0, 5);
            old.status.as_mut().unwrap().replicas = 2;

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set().times(0);

            let ctx = context(kube);
            rollout_recreate(&d, &new, &[old], &ctx).await.unwrap();
        }

        #[tokio::test]
        async fn new_set_comes_up_once_old_is_gone() {
            let d = deployment(3, MachineDeploymentStrategyType::Recreate, 0, 0);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 0, 0, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set()
                .times(1)
                .withf(|_, name, replicas| name.contains(NEW_HASH) && *replicas == 3)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            rollout_recreate(&d, &new, &[old], &ctx).await.unwrap();
        }
    }

    mod rolling {
        use super::*;

        #[tokio::test]
        async fn first_cycle_surges_the_new_set() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 0, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set()
                .times(1)
                .withf(|_, name, replicas| name.contains(NEW_HASH) && *replicas == 1)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            rollout_rolling(&d, &new, &[old], &ctx).await.unwrap();
        }

        #[tokio::test]
        async fn surged_and_available_new_machine_lets_old_shrink() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 1, 1, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set()
                .times(1)
                .withf(|_, name, replicas| name == "workers-oldhash" && *replicas == 2)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            rollout_rolling(&d, &new, &[old], &ctx).await.unwrap();
        }

        #[tokio::test]
        async fn unavailable_surge_machine_blocks_the_shrink() {
            let d = deployment(3, MachineDeploymentStrategyType::RollingUpdate, 1, 0);
            let new = machine_set(&d, NEW_HASH, 1, 0, 1);
            let old = machine_set(&d, OLD_HASH, 3, 3, 5);

            let mut kube = MockRolloutClient::new();
            kube.expect_scale_machine_set().times(0);

            let ctx = context(kube);
            rollout_rolling(&d, &new, &[old], &ctx).await.unwrap();
        }
    }
}
