//! MachineDeployment rollout orchestrator
//!
//! Resolves the deployment's template to a "new" MachineSet (by template
//! hash), treats every other owned set as "old", and drives the configured
//! strategy: Recreate, RollingUpdate (surge-then-shrink replacement), or
//! InPlaceUpdate (nodes updated in place, machine ownership transferred
//! between sets under the availability budget).

mod inplace;
mod rolling;
mod status;

pub use inplace::rollout_in_place;
pub use rolling::{rollout_recreate, rollout_rolling};
pub use status::{deployment_complete, sync_rollout_status};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::types::MACHINE_TEMPLATE_HASH_LABEL;
use crate::crd::{
    Machine, MachineDeployment, MachineDeploymentStatus, MachineDeploymentStrategyType,
    MachineSet, MachineSetSelector, MachineSetSpec, MachineTemplateSpec,
};
use crate::events::{actions, reasons, EventSink};
use crate::settings::Settings;
use crate::{Error, Result, RetryPeriod, API_GROUP_VERSION, CONTROLLER_NAME};

/// Kubernetes operations the rollout orchestrator needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RolloutClient: Send + Sync {
    /// List all MachineSets in the namespace.
    async fn list_machine_sets(&self, namespace: &str) -> Result<Vec<MachineSet>>;

    /// Create a MachineSet.
    async fn create_machine_set(&self, namespace: &str, ms: &MachineSet) -> Result<()>;

    /// Delete a MachineSet.
    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<()>;

    /// Patch a MachineSet's `spec.replicas`.
    async fn scale_machine_set(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Merge labels into a MachineSet's metadata.
    async fn merge_machine_set_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: serde_json::Value,
    ) -> Result<()>;

    /// List all Machines in the namespace.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;

    /// Merge-patch a Machine's metadata. Ownership transfer sends labels
    /// and ownerReferences in one patch so the transfer is atomic.
    async fn patch_machine_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Get a Node from the target cluster, None when absent.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Replace a Node object (uncordon, label and annotation rewrites).
    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Merge-patch a Node (taints, annotations).
    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()>;

    /// Patch the status subresource of the MachineDeployment.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineDeploymentStatus,
    ) -> Result<()>;
}

/// Production implementation over the control and target clients.
pub struct RolloutClientImpl {
    control: Client,
    target: Client,
}

impl RolloutClientImpl {
    /// Wrap the control-cluster and target-cluster clients.
    pub fn new(control: Client, target: Client) -> Self {
        Self { control, target }
    }
}

#[async_trait]
impl RolloutClient for RolloutClientImpl {
    async fn list_machine_sets(&self, namespace: &str) -> Result<Vec<MachineSet>> {
        let api: Api<MachineSet> = Api::namespaced(self.control.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn create_machine_set(&self, namespace: &str, ms: &MachineSet) -> Result<()> {
        let api: Api<MachineSet> = Api::namespaced(self.control.clone(), namespace);
        api.create(&PostParams::default(), ms).await?;
        Ok(())
    }

    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<MachineSet> = Api::namespaced(self.control.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scale_machine_set(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<MachineSet> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn merge_machine_set_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: serde_json::Value,
    ) -> Result<()> {
        let api: Api<MachineSet> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn patch_machine_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "metadata": metadata });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.target.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let api: Api<Node> = Api::all(self.target.clone());
        let name = node.metadata.name.as_deref().unwrap_or_default();
        api.replace(name, &PostParams::default(), node).await?;
        Ok(())
    }

    async fn patch_node(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.target.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineDeploymentStatus,
    ) -> Result<()> {
        let api: Api<MachineDeployment> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared context of the rollout orchestrator.
pub struct Context {
    /// Kubernetes operations seam
    pub kube: Arc<dyn RolloutClient>,
    /// Event sink
    pub events: EventSink,
    /// Behavioral settings
    pub settings: Settings,
    /// Safety freeze flag
    pub frozen: Arc<AtomicBool>,
}

// =============================================================================
// Template hashing and set resolution
// =============================================================================

/// Stable short hash of a machine template. Identical templates always
/// yield the same hash; the collision count salts the hash when a
/// hash-named set already exists with a different template.
pub fn template_hash(template: &MachineTemplateSpec, collision_count: Option<i32>) -> String {
    let serialized =
        serde_json::to_string(template).expect("machine template serializes to JSON");
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    if let Some(count) = collision_count {
        hasher.update(count.to_be_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(5)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

/// The deployment's template extended with the hash label, as carried by
/// the new MachineSet and every machine stamped from it.
pub fn hashed_template(deployment: &MachineDeployment, hash: &str) -> MachineTemplateSpec {
    let mut template = deployment.spec.template.clone();
    template
        .labels
        .insert(MACHINE_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    template
}

/// MachineSets owned by this deployment (controller owner ref match).
pub fn owned_machine_sets(deployment: &MachineDeployment, sets: Vec<MachineSet>) -> Vec<MachineSet> {
    let uid = deployment.uid();
    sets.into_iter()
        .filter(|ms| {
            ms.metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| {
                    refs.iter()
                        .any(|r| r.controller == Some(true) && Some(&r.uid) == uid.as_ref())
                })
        })
        .collect()
}

/// Split owned sets into (new, old) by the current template hash. Old sets
/// are ordered by ascending creation time, the order every rollout walks
/// them in.
pub fn classify_machine_sets(
    sets: Vec<MachineSet>,
    hash: &str,
) -> (Option<MachineSet>, Vec<MachineSet>) {
    let mut new_set = None;
    let mut old_sets = Vec::new();
    for ms in sets {
        let set_hash = ms
            .spec
            .selector
            .match_labels
            .get(MACHINE_TEMPLATE_HASH_LABEL);
        if set_hash.map(String::as_str) == Some(hash) && new_set.is_none() {
            new_set = Some(ms);
        } else {
            old_sets.push(ms);
        }
    }
    old_sets.sort_by(|a, b| {
        let a_created = a.meta().creation_timestamp.as_ref().map(|t| t.0);
        let b_created = b.meta().creation_timestamp.as_ref().map(|t| t.0);
        a_created.cmp(&b_created).then_with(|| a.name_any().cmp(&b.name_any()))
    });
    (new_set, old_sets)
}

/// Build the new MachineSet for the current template revision.
pub fn new_machine_set(deployment: &MachineDeployment, hash: &str, replicas: i32) -> MachineSet {
    let mut selector = deployment.spec.selector.clone();
    selector
        .match_labels
        .insert(MACHINE_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

    MachineSet {
        metadata: ObjectMeta {
            name: Some(format!("{}-{hash}", deployment.name_any())),
            namespace: deployment.namespace(),
            labels: Some(selector.match_labels.clone()),
            owner_references: Some(vec![OwnerReference {
                api_version: API_GROUP_VERSION.to_string(),
                kind: "MachineDeployment".to_string(),
                name: deployment.name_any(),
                uid: deployment.uid().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: MachineSetSpec {
            replicas,
            selector: MachineSetSelector {
                match_labels: selector.match_labels,
            },
            template: hashed_template(deployment, hash),
            min_ready_seconds: deployment.spec.min_ready_seconds,
        },
        status: None,
    }
}

/// Total desired replicas across sets.
pub fn total_replicas(sets: &[&MachineSet]) -> i32 {
    sets.iter().map(|ms| ms.spec.replicas).sum()
}

/// Total available replicas across sets, from their written status.
pub fn total_available(sets: &[&MachineSet]) -> i32 {
    sets.iter().map(|ms| ms.available_replicas()).sum()
}

/// True when every set's desired replicas is zero.
pub fn scaled_to_zero(sets: &[MachineSet]) -> bool {
    sets.iter().all(|ms| ms.spec.replicas == 0)
}

impl Context {
    /// Scale one MachineSet to `replicas`, recording an event. No-op when
    /// already at the target.
    pub async fn scale(
        &self,
        deployment: &MachineDeployment,
        ms: &MachineSet,
        replicas: i32,
    ) -> Result<bool> {
        if ms.spec.replicas == replicas {
            return Ok(false);
        }
        let namespace = deployment.namespace().unwrap_or_default();
        info!(
            machineset = %ms.name_any(),
            from = ms.spec.replicas,
            to = replicas,
            "scaling machine set"
        );
        self.kube
            .scale_machine_set(&namespace, &ms.name_any(), replicas)
            .await?;
        self.events
            .normal(
                &deployment.object_ref(&()),
                reasons::SCALING_MACHINE_SET,
                actions::SCALE,
                Some(format!(
                    "Scaled machine set {} from {} to {}",
                    ms.name_any(),
                    ms.spec.replicas,
                    replicas
                )),
            )
            .await;
        Ok(true)
    }

    /// Machines in the namespace matching `selector`.
    pub async fn machines_matching(
        &self,
        namespace: &str,
        selector: &MachineSetSelector,
    ) -> Result<Vec<Machine>> {
        let machines = self.kube.list_machines(namespace).await?;
        Ok(machines
            .into_iter()
            .filter(|m| selector.matches(m.metadata.labels.as_ref()))
            .collect())
    }
}

// =============================================================================
// Reconcile entry
// =============================================================================

/// Reconcile a single MachineDeployment.
#[instrument(
    skip(deployment, ctx),
    fields(
        deployment = %deployment.name_any(),
        strategy = ?deployment.spec.strategy.type_,
        desired = deployment.spec.replicas
    )
)]
pub async fn reconcile(
    deployment: Arc<MachineDeployment>,
    ctx: Arc<Context>,
) -> Result<Action> {
    use futures::FutureExt;

    std::panic::AssertUnwindSafe(reconcile_inner(deployment, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::internal("rollout", "reconcile panicked")))
}

async fn reconcile_inner(
    deployment: Arc<MachineDeployment>,
    ctx: Arc<Context>,
) -> Result<Action> {
    if ctx.frozen.load(Ordering::SeqCst) {
        debug!("operations frozen, skipping reconcile");
        return Ok(RetryPeriod::Long.action());
    }

    let namespace = deployment.namespace().unwrap_or_default();

    if deployment.meta().deletion_timestamp.is_some() {
        // Owner references cascade the deletion through MachineSets down to
        // Machines; each machine still runs its deletion ladder.
        return Ok(Action::await_change());
    }

    if let Err(e) = deployment.spec.validate() {
        warn!(error = %e, "deployment validation failed");
        ctx.events
            .warning(
                &deployment.object_ref(&()),
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    // Resolve new/old sets for the current template revision, creating the
    // new set if it does not exist yet.
    let collision_count = deployment.status.as_ref().and_then(|s| s.collision_count);
    let hash = template_hash(&deployment.spec.template, collision_count);
    let sets = ctx.kube.list_machine_sets(&namespace).await?;
    let all_set_names: Vec<String> = sets.iter().map(|ms| ms.name_any()).collect();
    let owned = owned_machine_sets(&deployment, sets);
    let (new_set, old_sets) = classify_machine_sets(owned, &hash);

    let new_set = match new_set {
        Some(ms) => ms,
        None => {
            let name = format!("{}-{hash}", deployment.name_any());
            // A set with the target name but a different template means a
            // hash collision: salt the hash and retry next reconcile.
            let colliding = all_set_names.iter().any(|n| *n == name);
            if colliding {
                warn!(set = %name, "template hash collision, bumping collision count");
                let mut status = deployment.status.clone().unwrap_or_default();
                status.collision_count = Some(status.collision_count.unwrap_or(0) + 1);
                ctx.kube
                    .patch_status(&namespace, &deployment.name_any(), &status)
                    .await?;
                return Ok(RetryPeriod::Short.action());
            }

            // Recreate holds the new set at zero until the old sets are
            // gone; the other strategies start from zero and surge.
            let ms = new_machine_set(&deployment, &hash, 0);
            info!(set = %ms.name_any(), "creating machine set for new template revision");
            ctx.kube.create_machine_set(&namespace, &ms).await?;
            return Ok(RetryPeriod::Short.action());
        }
    };

    if deployment.spec.paused {
        debug!("deployment paused, syncing status only");
        sync_rollout_status(&deployment, &new_set, &old_sets, &ctx).await?;
        return Ok(RetryPeriod::Medium.action());
    }

    match deployment.spec.strategy.type_ {
        MachineDeploymentStrategyType::Recreate => {
            rollout_recreate(&deployment, &new_set, &old_sets, &ctx).await?;
        }
        MachineDeploymentStrategyType::RollingUpdate => {
            rollout_rolling(&deployment, &new_set, &old_sets, &ctx).await?;
        }
        MachineDeploymentStrategyType::InPlaceUpdate => {
            rollout_in_place(&deployment, &new_set, &old_sets, &ctx).await?;
        }
    }

    sync_rollout_status(&deployment, &new_set, &old_sets, &ctx).await?;

    if deployment_complete(&deployment, &new_set, &old_sets) {
        cleanup_old_machine_sets(&deployment, &old_sets, &ctx).await?;
        return Ok(RetryPeriod::Long.action());
    }
    Ok(RetryPeriod::Short.action())
}

/// Prune empty old MachineSets beyond the revision history limit, oldest
/// first. Sets still holding machines are never pruned.
pub async fn cleanup_old_machine_sets(
    deployment: &MachineDeployment,
    old_sets: &[MachineSet],
    ctx: &Context,
) -> Result<()> {
    let limit = deployment.spec.revision_history_limit.unwrap_or(2).max(0) as usize;
    let namespace = deployment.namespace().unwrap_or_default();

    let empty: Vec<&MachineSet> = old_sets
        .iter()
        .filter(|ms| {
            ms.spec.replicas == 0
                && ms.status.as_ref().map(|s| s.replicas).unwrap_or(0) == 0
        })
        .collect();

    if empty.len() <= limit {
        return Ok(());
    }
    // old_sets arrive sorted by ascending creation time.
    for ms in &empty[..empty.len() - limit] {
        info!(set = %ms.name_any(), "pruning old machine set beyond history limit");
        ctx.kube
            .delete_machine_set(&namespace, &ms.name_any())
            .await?;
    }
    Ok(())
}

/// Error policy for the deployment controller.
pub fn error_policy(
    deployment: Arc<MachineDeployment>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    if error.is_conflict() {
        debug!(deployment = %deployment.name_any(), "conflict, requeueing");
        return RetryPeriod::Short.action();
    }
    error!(
        deployment = %deployment.name_any(),
        error = %error,
        "deployment reconciliation failed"
    );
    error.retry_period().action()
}

// =============================================================================
// Test fixtures shared by the rollout submodules
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crd::{
        ClassRef, MachineDeploymentSpec, MachineDeploymentStrategy, MachineSetStatus, MachineSpec,
        UpdateConfiguration,
    };
    use crate::crd::IntOrPercent;
    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    pub fn base_labels() -> BTreeMap<String, String> {
        BTreeMap::from([("pool".to_string(), "workers".to_string())])
    }

    /// A deployment of `replicas` workers with the given strategy.
    pub fn deployment(
        replicas: i32,
        strategy_type: MachineDeploymentStrategyType,
        max_surge: i32,
        max_unavailable: i32,
    ) -> MachineDeployment {
        let config = UpdateConfiguration {
            max_surge: Some(IntOrPercent::Int(max_surge)),
            max_unavailable: Some(IntOrPercent::Int(max_unavailable)),
        };
        let mut d = MachineDeployment::new(
            "workers",
            MachineDeploymentSpec {
                replicas,
                selector: MachineSetSelector {
                    match_labels: base_labels(),
                },
                template: MachineTemplateSpec {
                    labels: base_labels(),
                    annotations: BTreeMap::new(),
                    spec: MachineSpec {
                        class: ClassRef {
                            name: "small".into(),
                        },
                        provider_id: None,
                        configuration: None,
                    },
                },
                strategy: MachineDeploymentStrategy {
                    type_: strategy_type,
                    rolling_update: matches!(
                        strategy_type,
                        MachineDeploymentStrategyType::RollingUpdate
                    )
                    .then(|| config.clone()),
                    in_place_update: matches!(
                        strategy_type,
                        MachineDeploymentStrategyType::InPlaceUpdate
                    )
                    .then(|| config),
                },
                min_ready_seconds: None,
                revision_history_limit: None,
                paused: false,
                progress_deadline_seconds: None,
            },
        );
        d.metadata.namespace = Some("default".into());
        d.metadata.uid = Some("md-uid-1".into());
        d
    }

    /// A MachineSet owned by `d` with the given hash, desired and
    /// available counts. `age_hours` orders old sets.
    pub fn machine_set(
        d: &MachineDeployment,
        hash: &str,
        replicas: i32,
        available: i32,
        age_hours: i64,
    ) -> MachineSet {
        let mut ms = new_machine_set(d, hash, replicas);
        ms.metadata.uid = Some(format!("ms-uid-{hash}"));
        ms.metadata.creation_timestamp =
            Some(Time(Utc::now() - ChronoDuration::hours(age_hours)));
        ms.status = Some(MachineSetStatus {
            replicas,
            ready_replicas: available,
            available_replicas: available,
            observed_generation: None,
            failed_machines: vec![],
        });
        ms
    }

    pub fn context(kube: MockRolloutClient) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            events: EventSink::disabled(),
            settings: Settings::default(),
            frozen: Arc::new(AtomicBool::new(false)),
        })
    }
}
