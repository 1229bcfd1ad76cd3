//! Node drain engine
//!
//! Evacuates workload pods from one node within a deadline, then reports
//! whether the VM is safe to delete. Cordons the node, evicts pods through
//! the `policy/v1` Eviction subresource (honoring PodDisruptionBudgets with
//! bounded retries), and waits for provider volumes to detach.
//!
//! Force drain skips PDB-respecting eviction and deletes pods directly; it
//! is used when the node has been unhealthy beyond the drain deadline or
//! the machine carries the force-deletion label. Volume detachment is still
//! awaited, with a shorter budget.
//!
//! The engine runs inline within the owning machine reconcile and is
//! bounded by the drain deadline at every stage, so controller shutdown or
//! a vanished Machine never leaves a detached background task.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, Patch, PatchParams};
use kube::Client;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Annotation marking mirror pods of static manifests; never evicted.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Node condition type signalling the node is being terminated.
pub const NODE_TERMINATION_CONDITION: &str = "NodeTermination";

/// Reason written with the termination condition after a clean drain.
pub const REASON_DRAINED: &str = "Drained";

/// Reason written when the drain was forced or ran out of budget.
pub const REASON_FORCE_DRAINED: &str = "ForceDrained";

/// Result of a drain run that did not error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All pods evicted and tracked volumes detached within budget
    Drained,
    /// Deadline or volume budget lapsed; the caller proceeds to VM deletion
    /// regardless, with volume detachment re-checked as its own step
    ForceContinued,
}

/// Per-run drain parameters.
#[derive(Clone, Debug)]
pub struct DrainOptions {
    /// Total drain budget
    pub timeout: Duration,
    /// Skip PDB-respecting eviction and delete pods directly
    pub force: bool,
    /// Per-pod eviction retry cap when PDBs reject the eviction
    pub max_evict_retries: u32,
    /// Volume-detach budget for a normal drain
    pub pv_detach_timeout: Duration,
    /// Volume-detach budget under force drain
    pub force_pv_detach_timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            force: false,
            max_evict_retries: 10,
            pv_detach_timeout: Duration::from_secs(2 * 60),
            force_pv_detach_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single pod eviction attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictAttempt {
    /// Eviction accepted
    Evicted,
    /// A PodDisruptionBudget rejected the eviction; retry with backoff
    BlockedByPdb,
    /// The pod no longer exists
    Gone,
}

/// Kubernetes operations the drain engine needs.
///
/// A thin seam over the target-cluster client so the engine is testable
/// without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DrainClient: Send + Sync {
    /// Mark the node unschedulable.
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Fetch the node, None when it no longer exists.
    async fn get_node(&self, node: &str) -> Result<Option<Node>>;

    /// List all pods bound to the node.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// Issue an eviction for the pod with the given grace period.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: Option<i64>,
    ) -> Result<EvictAttempt>;

    /// Delete the pod directly, bypassing PDBs (force drain only).
    async fn delete_pod(&self, namespace: &str, name: &str, grace_seconds: Option<i64>)
        -> Result<()>;

    /// Write the `NodeTermination` condition (Status=True) on the node so
    /// node-level tooling knows the VM is going away.
    async fn set_termination_condition(&self, node: &str, reason: &str) -> Result<()>;
}

/// Production implementation over the target-cluster client.
pub struct DrainClientImpl {
    client: Client,
}

impl DrainClientImpl {
    /// Wrap the target-cluster client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DrainClient for DrainClientImpl {
    async fn cordon(&self, node: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({"spec": {"unschedulable": true}});
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_node(&self, node: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(node).await {
            Ok(n) => Ok(Some(n)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = kube::api::ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: Option<i64>,
    ) -> Result<EvictAttempt> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: grace_seconds.map(|s| s as u32),
                ..Default::default()
            }),
            ..Default::default()
        };
        match api.evict(name, &params).await {
            Ok(_) => Ok(EvictAttempt::Evicted),
            // 429 is how the eviction API reports a PDB rejection.
            Err(kube::Error::Api(ae)) if ae.code == 429 => Ok(EvictAttempt::BlockedByPdb),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictAttempt::Gone),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_seconds: Option<i64>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: grace_seconds.map(|s| s as u32),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_termination_condition(&self, node: &str, reason: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let current = match api.get(node).await {
            Ok(n) => n,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut conditions = current
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let now = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now());
        let condition = k8s_openapi::api::core::v1::NodeCondition {
            type_: NODE_TERMINATION_CONDITION.to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message: Some("Node is scheduled for termination".to_string()),
            last_heartbeat_time: Some(now.clone()),
            last_transition_time: Some(now),
        };
        match conditions
            .iter_mut()
            .find(|c| c.type_ == NODE_TERMINATION_CONDITION)
        {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }

        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        api.patch_status(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// True for pods the drain must leave alone: mirror pods, DaemonSet pods
/// (their controller would recreate them on the same node anyway), and pods
/// that already ran to completion.
pub fn is_drainable(pod: &Pod) -> bool {
    if pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
    {
        return false;
    }
    if pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
    {
        return false;
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    !matches!(phase, "Succeeded" | "Failed")
}

/// Volume IDs currently attached to the node, per `status.volumesAttached`.
pub fn attached_volume_ids(node: &Node) -> BTreeSet<String> {
    node.status
        .as_ref()
        .and_then(|s| s.volumes_attached.as_ref())
        .map(|vols| vols.iter().map(|v| v.name.clone()).collect())
        .unwrap_or_default()
}

/// The drain engine. One instance per drain run.
pub struct DrainEngine<'a> {
    client: &'a dyn DrainClient,
    options: DrainOptions,
}

impl<'a> DrainEngine<'a> {
    /// Create an engine over the given client and options.
    pub fn new(client: &'a dyn DrainClient, options: DrainOptions) -> Self {
        Self { client, options }
    }

    /// Drain the node: cordon, evict (or force-delete) pods, await volume
    /// detachment.
    ///
    /// `tracked_volumes` are the provider volume IDs (from the driver's
    /// `get_volume_ids`) whose detachment gates VM deletion; pass an empty
    /// set to wait for all attachments to clear.
    ///
    /// Errors are returned only while the drain budget is intact; once the
    /// budget lapses the run reports [`DrainOutcome::ForceContinued`] so
    /// the deletion ladder can advance.
    pub async fn run(
        &self,
        node_name: &str,
        tracked_volumes: &BTreeSet<String>,
    ) -> Result<DrainOutcome> {
        let deadline = Instant::now() + self.options.timeout;

        self.client.cordon(node_name).await?;
        info!(node = %node_name, force = self.options.force, "node cordoned, draining");

        let pods = self.client.list_pods_on_node(node_name).await?;
        let drainable: Vec<Pod> = pods.into_iter().filter(is_drainable).collect();
        debug!(node = %node_name, pods = drainable.len(), "pods to evacuate");

        for pod in &drainable {
            if Instant::now() >= deadline {
                warn!(node = %node_name, "drain budget lapsed mid-eviction, force-continuing");
                self.mark_terminating(node_name, REASON_FORCE_DRAINED).await;
                return Ok(DrainOutcome::ForceContinued);
            }
            self.evacuate_pod(node_name, pod, deadline).await?;
        }

        let reason = if self.options.force {
            REASON_FORCE_DRAINED
        } else {
            REASON_DRAINED
        };
        self.mark_terminating(node_name, reason).await;

        let volume_budget = if self.options.force {
            self.options.force_pv_detach_timeout
        } else {
            self.options.pv_detach_timeout
        };
        let detached = self
            .wait_for_volume_detach(node_name, tracked_volumes, volume_budget)
            .await?;
        if !detached {
            warn!(node = %node_name, "volumes still attached after budget, continuing");
            return Ok(DrainOutcome::ForceContinued);
        }

        info!(node = %node_name, "drain complete");
        Ok(DrainOutcome::Drained)
    }

    /// Best-effort write of the termination condition; the drain outcome
    /// does not depend on it.
    async fn mark_terminating(&self, node_name: &str, reason: &str) {
        if let Err(e) = self
            .client
            .set_termination_condition(node_name, reason)
            .await
        {
            warn!(node = %node_name, error = %e, "failed to set termination condition");
        }
    }

    /// Evacuate one pod: direct delete under force, eviction with PDB
    /// backoff otherwise. Grace period is the pod's own, capped by the
    /// remaining drain budget.
    async fn evacuate_pod(&self, node_name: &str, pod: &Pod, deadline: Instant) -> Result<()> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let grace = pod
            .spec
            .as_ref()
            .and_then(|s| s.termination_grace_period_seconds)
            .map(|g| g.min(remaining.as_secs() as i64));

        if self.options.force {
            debug!(pod = %name, "force drain, deleting pod directly");
            return self.client.delete_pod(namespace, name, Some(0)).await;
        }

        let mut delay = Duration::from_secs(5);
        for attempt in 0..=self.options.max_evict_retries {
            if Instant::now() >= deadline {
                return Err(Error::drain(
                    node_name,
                    format!("drain budget lapsed evicting pod {namespace}/{name}"),
                ));
            }
            match self.client.evict_pod(namespace, name, grace).await? {
                EvictAttempt::Evicted | EvictAttempt::Gone => return Ok(()),
                EvictAttempt::BlockedByPdb => {
                    debug!(pod = %name, attempt, "eviction blocked by PDB, backing off");
                    // Jitter 0.5x-1.5x to avoid synchronized retries across pods.
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let sleep = Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(sleep).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }

        Err(Error::drain(
            node_name,
            format!(
                "pod {namespace}/{name} still blocked by PodDisruptionBudget after {} eviction attempts",
                self.options.max_evict_retries
            ),
        ))
    }

    /// Poll the node until the tracked volumes (or, with an empty filter,
    /// all volumes) are gone from `status.volumesAttached`. Returns false
    /// when the budget lapses first. A vanished node counts as detached.
    pub async fn wait_for_volume_detach(
        &self,
        node_name: &str,
        tracked_volumes: &BTreeSet<String>,
        budget: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + budget;
        loop {
            let Some(node) = self.client.get_node(node_name).await? else {
                return Ok(true);
            };
            let attached = attached_volume_ids(&node);
            let blocking: Vec<&String> = if tracked_volumes.is_empty() {
                attached.iter().collect()
            } else {
                attached.intersection(tracked_volumes).collect()
            };
            if blocking.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!(node = %node_name, remaining = blocking.len(), "volume detach budget lapsed");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}
