//! MachineSet controller
//!
//! Holds the replica invariant for one MachineSet: creates machines from
//! the template when short, deletes the lowest-priority machines when
//! over, adopts matching orphans, releases machines that stopped matching,
//! and garbage-collects machines that failed permanently. Expectations
//! accounting prevents a slow informer from turning one scale decision
//! into two.

pub mod expectations;

pub use expectations::{Direction, Expectations};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::types::{DEFAULT_PRIORITY, PRIORITY_ANNOTATION};
use crate::crd::{
    FailedMachineSummary, Machine, MachinePhase, MachineSet, MachineSetStatus, MachineSpec,
};
use crate::events::{actions, reasons, EventSink};
use crate::settings::Settings;
use crate::{Error, Result, RetryPeriod, API_GROUP_VERSION, CONTROLLER_NAME};

/// Kubernetes operations the MachineSet controller needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineSetClient: Send + Sync {
    /// List all machines in the namespace; the controller filters by
    /// selector itself.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;

    /// Create a machine object.
    async fn create_machine(&self, namespace: &str, machine: &Machine) -> Result<()>;

    /// Delete a machine object (sets its deletion timestamp; the machine
    /// controller runs the deletion ladder).
    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge-patch machine metadata (owner references for adopt/release).
    async fn patch_machine_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Patch the status subresource of the MachineSet.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineSetStatus,
    ) -> Result<()>;
}

/// Production implementation over the control-cluster client.
pub struct MachineSetClientImpl {
    client: Client,
}

impl MachineSetClientImpl {
    /// Wrap the control-cluster client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineSetClient for MachineSetClientImpl {
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn create_machine(&self, namespace: &str, machine: &Machine) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), machine).await?;
        Ok(())
    }

    async fn delete_machine(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_machine_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": metadata });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineSetStatus,
    ) -> Result<()> {
        let api: Api<MachineSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared context of the MachineSet controller.
pub struct Context {
    /// Kubernetes operations seam
    pub kube: Arc<dyn MachineSetClient>,
    /// Event sink
    pub events: EventSink,
    /// Behavioral settings
    pub settings: Settings,
    /// Safety freeze flag
    pub frozen: Arc<AtomicBool>,
    /// Pending scale expectations, shared across reconciles
    pub expectations: Arc<Expectations>,
}

/// The machine controller's owner reference on a machine, if any.
pub fn controller_owner(machine: &Machine) -> Option<&OwnerReference> {
    machine
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// True when `machine` is controlled by `ms` (matching controller owner).
pub fn is_controlled_by(machine: &Machine, ms: &MachineSet) -> bool {
    controller_owner(machine)
        .map(|owner| Some(owner.uid.as_str()) == ms.uid().as_deref())
        .unwrap_or(false)
}

/// Deterministic scale-down order: lowest priority first, then newest
/// first, then name. Replayable across reconciles by construction.
pub fn select_victims<'a>(machines: &'a [Machine], count: usize) -> Vec<&'a Machine> {
    let mut candidates: Vec<&Machine> = machines.iter().collect();
    candidates.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| {
                let a_created = a.meta().creation_timestamp.as_ref().map(|t| t.0);
                let b_created = b.meta().creation_timestamp.as_ref().map(|t| t.0);
                b_created.cmp(&a_created)
            })
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    candidates.truncate(count);
    candidates
}

/// Stamp a new machine from the set's template: labels, annotations with
/// the default priority, controller owner reference, generated name.
pub fn new_machine_from_template(ms: &MachineSet) -> Machine {
    let template = &ms.spec.template;

    let mut annotations = template.annotations.clone();
    annotations
        .entry(PRIORITY_ANNOTATION.to_string())
        .or_insert_with(|| DEFAULT_PRIORITY.to_string());

    Machine {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", ms.name_any())),
            namespace: ms.namespace(),
            labels: Some(template.labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(ms)]),
            ..Default::default()
        },
        spec: MachineSpec {
            // providerID is assigned by the machine controller, never the
            // template.
            provider_id: None,
            ..template.spec.clone()
        },
        status: None,
    }
}

/// Controller owner reference pointing at `ms`.
fn owner_reference(ms: &MachineSet) -> OwnerReference {
    OwnerReference {
        api_version: API_GROUP_VERSION.to_string(),
        kind: "MachineSet".to_string(),
        name: ms.name_any(),
        uid: ms.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Compute the set's status from its machines.
pub fn compute_status(ms: &MachineSet, machines: &[Machine]) -> MachineSetStatus {
    let min_ready = ms.spec.min_ready_seconds.unwrap_or(0) as i64;
    let now = Utc::now();

    let mut ready = 0;
    let mut available = 0;
    let mut failed = Vec::new();

    for machine in machines {
        match machine.phase() {
            MachinePhase::Running => {
                ready += 1;
                let ready_since = machine
                    .status
                    .as_ref()
                    .and_then(|s| s.current_status.last_update_time);
                let available_now = match ready_since {
                    Some(since) => (now - since).num_seconds() >= min_ready,
                    None => min_ready == 0,
                };
                if available_now {
                    available += 1;
                }
            }
            MachinePhase::Failed => {
                failed.push(FailedMachineSummary {
                    name: machine.name_any(),
                    error_code: machine
                        .status
                        .as_ref()
                        .and_then(|s| s.last_operation.as_ref())
                        .and_then(|op| op.error_code.clone()),
                    message: machine
                        .status
                        .as_ref()
                        .and_then(|s| s.last_operation.as_ref())
                        .map(|op| op.description.clone())
                        .unwrap_or_else(|| "machine failed".to_string()),
                });
            }
            _ => {}
        }
    }

    MachineSetStatus {
        replicas: machines.len() as i32,
        ready_replicas: ready,
        available_replicas: available,
        observed_generation: ms.metadata.generation,
        failed_machines: failed,
    }
}

/// Reconcile a single MachineSet. Panics are trapped and surfaced as
/// internal errors so one poisoned object cannot stop the worker.
#[instrument(
    skip(ms, ctx),
    fields(machineset = %ms.name_any(), desired = ms.spec.replicas)
)]
pub async fn reconcile(ms: Arc<MachineSet>, ctx: Arc<Context>) -> Result<Action> {
    use futures::FutureExt;

    std::panic::AssertUnwindSafe(reconcile_inner(ms, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::internal("machineset", "reconcile panicked")))
}

async fn reconcile_inner(ms: Arc<MachineSet>, ctx: Arc<Context>) -> Result<Action> {
    if ctx.frozen.load(Ordering::SeqCst) {
        debug!("operations frozen, skipping reconcile");
        return Ok(RetryPeriod::Long.action());
    }

    let namespace = ms.namespace().unwrap_or_default();
    let key = format!("{namespace}/{}", ms.name_any());

    if ms.meta().deletion_timestamp.is_some() {
        ctx.expectations.forget(&key);
        return Ok(Action::await_change());
    }

    let all_machines = ctx.kube.list_machines(&namespace).await?;

    // Ownership pass: adopt matching orphans, release mismatches.
    let mut owned: Vec<Machine> = Vec::new();
    for machine in all_machines {
        let matches = ms.spec.selector.matches(machine.metadata.labels.as_ref());
        let controlled = is_controlled_by(&machine, &ms);

        if controlled && !matches {
            info!(machine = %machine.name_any(), "releasing machine that no longer matches selector");
            ctx.kube
                .patch_machine_metadata(
                    &namespace,
                    &machine.name_any(),
                    serde_json::json!({ "ownerReferences": [] }),
                )
                .await?;
            continue;
        }
        if matches && !controlled {
            if controller_owner(&machine).is_some() {
                // Owned by another controller (e.g. mid ownership transfer);
                // never steal.
                continue;
            }
            info!(machine = %machine.name_any(), "adopting orphan machine");
            ctx.kube
                .patch_machine_metadata(
                    &namespace,
                    &machine.name_any(),
                    serde_json::json!({ "ownerReferences": [owner_reference(&ms)] }),
                )
                .await?;
            owned.push(machine);
            continue;
        }
        if matches && controlled {
            owned.push(machine);
        }
    }

    // Garbage-collect permanently failed machines so replacements restore
    // the replica count.
    let mut collected = false;
    for machine in owned.iter().filter(|m| {
        m.phase() == MachinePhase::Failed && !m.is_terminating()
    }) {
        warn!(machine = %machine.name_any(), "deleting Failed machine");
        ctx.kube
            .delete_machine(&namespace, &machine.name_any())
            .await?;
        collected = true;
    }
    if collected {
        let status = compute_status(&ms, &owned);
        ctx.kube
            .patch_status(&namespace, &ms.name_any(), &status)
            .await?;
        return Ok(RetryPeriod::Short.action());
    }

    // Scale gate: a prior reconcile's creates/deletes must be visible in
    // the cache before this one may scale again.
    let observed = owned.iter().filter(|m| !m.is_terminating()).count();
    if !ctx.expectations.satisfied(&key, observed) {
        debug!(observed, "expectations unmet, skipping scale");
        let status = compute_status(&ms, &owned);
        ctx.kube
            .patch_status(&namespace, &ms.name_any(), &status)
            .await?;
        return Ok(RetryPeriod::Short.action());
    }

    let active: Vec<&Machine> = owned.iter().filter(|m| m.is_active()).collect();
    let desired = ms.spec.replicas.max(0) as usize;

    if active.len() > desired {
        let surplus = active.len() - desired;
        let active_owned: Vec<Machine> = active.iter().map(|m| (*m).clone()).collect();
        let victims = select_victims(&active_owned, surplus);

        info!(surplus, "scaling down machine set");
        ctx.expectations
            .expect(&key, observed - surplus, Direction::AtMost);
        for victim in &victims {
            ctx.events
                .normal(
                    &ms.object_ref(&()),
                    reasons::SCALING_MACHINE_SET,
                    actions::SCALE,
                    Some(format!("Deleting machine {}", victim.name_any())),
                )
                .await;
            ctx.kube
                .delete_machine(&namespace, &victim.name_any())
                .await?;
        }
    } else if active.len() < desired {
        if ms.skip_update() {
            // Frozen by the rollout orchestrator: machines leaving this set
            // mid in-place update must not be recreated.
            debug!("skip-update label present, not scaling up");
        } else {
            let deficit = desired - active.len();
            info!(deficit, "scaling up machine set");
            ctx.expectations
                .expect(&key, observed + deficit, Direction::AtLeast);
            for _ in 0..deficit {
                let machine = new_machine_from_template(&ms);
                ctx.events
                    .normal(
                        &ms.object_ref(&()),
                        reasons::SCALING_MACHINE_SET,
                        actions::SCALE,
                        Some("Creating machine from template".to_string()),
                    )
                    .await;
                ctx.kube.create_machine(&namespace, &machine).await?;
            }
        }
    }

    let status = compute_status(&ms, &owned);
    ctx.kube
        .patch_status(&namespace, &ms.name_any(), &status)
        .await?;

    Ok(Action::requeue(std::time::Duration::from_secs(10 * 60)))
}

/// Error policy for the MachineSet controller.
pub fn error_policy(ms: Arc<MachineSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(machineset = %ms.name_any(), "conflict, requeueing");
        return RetryPeriod::Short.action();
    }
    error!(
        machineset = %ms.name_any(),
        error = %error,
        "machineset reconciliation failed"
    );
    error.retry_period().action()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crd::{
        ClassRef, CurrentStatus, MachineSetSelector, MachineSetSpec, MachineStatus,
        MachineTemplateSpec,
    };
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn selector_labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("pool".to_string(), "workers".to_string()),
            ("machine-template-hash".to_string(), "abc123".to_string()),
        ])
    }

    fn machine_set(replicas: i32) -> MachineSet {
        let mut ms = MachineSet::new(
            "workers-abc123",
            MachineSetSpec {
                replicas,
                selector: MachineSetSelector {
                    match_labels: selector_labels(),
                },
                template: MachineTemplateSpec {
                    labels: selector_labels(),
                    annotations: BTreeMap::new(),
                    spec: MachineSpec {
                        class: ClassRef {
                            name: "small".into(),
                        },
                        provider_id: None,
                        configuration: None,
                    },
                },
                min_ready_seconds: None,
            },
        );
        ms.metadata.namespace = Some("default".into());
        ms.metadata.uid = Some("ms-uid-1".into());
        ms
    }

    fn owned_machine(name: &str, ms: &MachineSet, phase: MachinePhase) -> Machine {
        let mut machine = new_machine_from_template(ms);
        machine.metadata.name = Some(name.to_string());
        machine.metadata.generate_name = None;
        machine.metadata.creation_timestamp = Some(Time(Utc::now()));
        machine.status = Some(MachineStatus {
            current_status: CurrentStatus::new(phase),
            last_operation: None,
            conditions: vec![],
        });
        machine
    }

    fn context(kube: MockMachineSetClient) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            events: EventSink::disabled(),
            settings: Settings::default(),
            frozen: Arc::new(AtomicBool::new(false)),
            expectations: Arc::new(Expectations::new()),
        })
    }

    mod victim_selection {
        use super::*;

        #[test]
        fn lowest_priority_goes_first() {
            let ms = machine_set(3);
            let mut keep = owned_machine("machine-a", &ms, MachinePhase::Running);
            keep.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(PRIORITY_ANNOTATION.to_string(), "5".to_string());
            let mut evict = owned_machine("machine-b", &ms, MachinePhase::Running);
            evict
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(PRIORITY_ANNOTATION.to_string(), "1".to_string());

            let machines = vec![keep, evict];
            let victims = select_victims(&machines, 1);
            assert_eq!(victims[0].name_any(), "machine-b");
        }

        #[test]
        fn newest_goes_first_within_equal_priority() {
            let ms = machine_set(3);
            let mut old = owned_machine("machine-old", &ms, MachinePhase::Running);
            old.metadata.creation_timestamp =
                Some(Time(Utc::now() - ChronoDuration::hours(2)));
            let new = owned_machine("machine-new", &ms, MachinePhase::Running);

            let machines = vec![old, new];
            let victims = select_victims(&machines, 1);
            assert_eq!(victims[0].name_any(), "machine-new");
        }

        #[test]
        fn name_breaks_remaining_ties() {
            let ms = machine_set(3);
            let ts = Time(Utc::now());
            let mut a = owned_machine("machine-a", &ms, MachinePhase::Running);
            a.metadata.creation_timestamp = Some(ts.clone());
            let mut b = owned_machine("machine-b", &ms, MachinePhase::Running);
            b.metadata.creation_timestamp = Some(ts);

            let machines = vec![b, a];
            let victims = select_victims(&machines, 1);
            assert_eq!(victims[0].name_any(), "machine-a");
        }
    }

    mod template_stamping {
        use super::*;

        #[test]
        fn new_machine_carries_owner_and_priority() {
            let ms = machine_set(3);
            let machine = new_machine_from_template(&ms);

            assert_eq!(
                machine.metadata.generate_name.as_deref(),
                Some("workers-abc123-")
            );
            assert_eq!(machine.priority(), DEFAULT_PRIORITY);
            let owner = controller_owner(&machine).expect("owner ref");
            assert_eq!(owner.kind, "MachineSet");
            assert_eq!(owner.uid, "ms-uid-1");
            assert!(ms
                .spec
                .selector
                .matches(machine.metadata.labels.as_ref()));
        }

        #[test]
        fn template_never_leaks_a_provider_id() {
            let mut ms = machine_set(1);
            ms.spec.template.spec.provider_id = Some("stale:///leftover".into());
            let machine = new_machine_from_template(&ms);
            assert_eq!(machine.spec.provider_id, None);
        }
    }

    mod status {
        use super::*;

        #[test]
        fn ready_and_available_follow_min_ready_seconds() {
            let mut ms = machine_set(2);
            ms.spec.min_ready_seconds = Some(300);

            let mut fresh = owned_machine("machine-fresh", &ms, MachinePhase::Running);
            fresh.status.as_mut().unwrap().current_status.last_update_time =
                Some(Utc::now() - ChronoDuration::seconds(10));
            let mut seasoned = owned_machine("machine-seasoned", &ms, MachinePhase::Running);
            seasoned
                .status
                .as_mut()
                .unwrap()
                .current_status
                .last_update_time = Some(Utc::now() - ChronoDuration::seconds(600));

            let status = compute_status(&ms, &[fresh, seasoned]);
            assert_eq!(status.replicas, 2);
            assert_eq!(status.ready_replicas, 2);
            assert_eq!(status.available_replicas, 1);
        }

        #[test]
        fn failed_machines_are_summarized() {
            let ms = machine_set(1);
            let mut failed = owned_machine("machine-dead", &ms, MachinePhase::Failed);
            failed.status.as_mut().unwrap().last_operation = Some(
                crate::crd::LastOperation::new(
                    "Provider error: quota exceeded",
                    crate::crd::MachineState::Failed,
                    crate::crd::OperationType::Create,
                )
                .with_error_code("ResourceExhausted"),
            );

            let status = compute_status(&ms, &[failed]);
            assert_eq!(status.failed_machines.len(), 1);
            assert_eq!(
                status.failed_machines[0].error_code.as_deref(),
                Some("ResourceExhausted")
            );
        }
    }

    mod reconcile_flow {
        use super::*;

        #[tokio::test]
        async fn deficit_creates_machines() {
            let ms = machine_set(3);
            let existing = vec![
                owned_machine("machine-0", &ms, MachinePhase::Running),
                owned_machine("machine-1", &ms, MachinePhase::Running),
            ];

            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(existing.clone()));
            kube.expect_create_machine()
                .times(1)
                .withf(|_, machine| machine.metadata.generate_name.is_some())
                .returning(|_, _| Ok(()));
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }

        #[tokio::test]
        async fn surplus_deletes_lowest_priority_first() {
            let ms = machine_set(1);
            let mut low = owned_machine("machine-low", &ms, MachinePhase::Running);
            low.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(PRIORITY_ANNOTATION.to_string(), "1".to_string());
            let keep = owned_machine("machine-keep", &ms, MachinePhase::Running);

            let machines = vec![low, keep];
            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_delete_machine()
                .times(1)
                .withf(|_, name| name == "machine-low")
                .returning(|_, _| Ok(()));
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }

        #[tokio::test]
        async fn unmet_expectations_block_scaling() {
            let ms = machine_set(3);
            let existing = vec![owned_machine("machine-0", &ms, MachinePhase::Running)];

            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(existing.clone()));
            kube.expect_create_machine().times(0);
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            let ctx = context(kube);
            // A previous reconcile already asked for three machines.
            ctx.expectations
                .expect("default/workers-abc123", 3, Direction::AtLeast);

            reconcile(Arc::new(ms), ctx).await.unwrap();
        }

        #[tokio::test]
        async fn failed_machines_are_collected_before_scaling() {
            let ms = machine_set(2);
            let machines = vec![
                owned_machine("machine-ok", &ms, MachinePhase::Running),
                owned_machine("machine-dead", &ms, MachinePhase::Failed),
            ];

            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_delete_machine()
                .times(1)
                .withf(|_, name| name == "machine-dead")
                .returning(|_, _| Ok(()));
            // No creation this cycle; replacement happens next reconcile.
            kube.expect_create_machine().times(0);
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }

        #[tokio::test]
        async fn skip_update_label_blocks_scale_up() {
            let mut ms = machine_set(3);
            ms.metadata.labels = Some(BTreeMap::from([(
                crate::crd::types::LABEL_KEY_SKIP_UPDATE.to_string(),
                "true".to_string(),
            )]));
            let existing = vec![owned_machine("machine-0", &ms, MachinePhase::Running)];

            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(existing.clone()));
            kube.expect_create_machine().times(0);
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }

        #[tokio::test]
        async fn orphans_matching_selector_are_adopted() {
            let ms = machine_set(1);
            let mut orphan = owned_machine("machine-orphan", &ms, MachinePhase::Running);
            orphan.metadata.owner_references = None;

            let machines = vec![orphan];
            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_patch_machine_metadata()
                .times(1)
                .withf(|_, name, patch| {
                    name == "machine-orphan"
                        && patch["ownerReferences"][0]["uid"] == "ms-uid-1"
                })
                .returning(|_, _, _| Ok(()));
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }

        #[tokio::test]
        async fn machines_owned_elsewhere_are_not_stolen() {
            let ms = machine_set(1);
            let mut foreign = owned_machine("machine-foreign", &ms, MachinePhase::Running);
            foreign.metadata.owner_references = Some(vec![OwnerReference {
                api_version: API_GROUP_VERSION.to_string(),
                kind: "MachineSet".to_string(),
                name: "workers-other".to_string(),
                uid: "other-uid".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]);

            let machines = vec![foreign];
            let mut kube = MockMachineSetClient::new();
            kube.expect_list_machines()
                .returning(move |_| Ok(machines.clone()));
            kube.expect_patch_machine_metadata().times(0);
            // The foreign machine does not count toward this set, so a
            // replacement is created.
            kube.expect_create_machine().times(1).returning(|_, _| Ok(()));
            kube.expect_patch_status().returning(|_, _, _| Ok(()));

            reconcile(Arc::new(ms), context(kube)).await.unwrap();
        }
    }
}
