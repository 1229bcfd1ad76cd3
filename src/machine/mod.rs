//! Machine lifecycle controller
//!
//! Drives each Machine through its lifecycle: provider VM creation, node
//! join, health tracking, and the ordered deletion ladder (drain, volume
//! detach, VM deletion, node deletion, finalizer removal). Every transition
//! persists a `lastOperation` record before the next step runs, so a
//! controller restart resumes exactly where the previous process stopped.

mod creation;
mod deletion;
mod health;

pub use health::{is_node_healthy, is_node_ready, node_condition_true};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Machine, MachineClass, MachineStatus};
use crate::drain::DrainClient;
use crate::driver::Driver;
use crate::events::EventSink;
use crate::settings::Settings;
use crate::{Error, Result, CONTROLLER_NAME, MACHINE_FINALIZER};

/// Kubernetes operations the machine controller needs.
///
/// This trait allows mocking the Kubernetes clients in tests while using
/// the real clients in production. Machines and classes live on the control
/// cluster; nodes live on the target cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Get a MachineClass by name, None when absent.
    async fn get_machine_class(&self, namespace: &str, name: &str)
        -> Result<Option<MachineClass>>;

    /// Get a Secret by name, None when absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Patch the status subresource of a Machine.
    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineStatus,
    ) -> Result<()>;

    /// Record the provider ID on the Machine spec. Called exactly once per
    /// machine; the provider ID is never rewritten afterwards.
    async fn set_provider_id(&self, namespace: &str, name: &str, provider_id: &str) -> Result<()>;

    /// Merge labels into the Machine metadata.
    async fn merge_machine_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: serde_json::Value,
    ) -> Result<()>;

    /// Add the lifecycle finalizer to the Machine.
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the lifecycle finalizer from the Machine.
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a Node from the target cluster, None when absent.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Delete a Node from the target cluster; absent nodes are a no-op.
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Production implementation over the control and target clients.
pub struct MachineClientImpl {
    control: Client,
    target: Client,
}

impl MachineClientImpl {
    /// Wrap the control-cluster and target-cluster clients.
    pub fn new(control: Client, target: Client) -> Self {
        Self { control, target }
    }
}

#[async_trait]
impl MachineClient for MachineClientImpl {
    async fn get_machine_class(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineClass>> {
        let api: Api<MachineClass> = Api::namespaced(self.control.clone(), namespace);
        match api.get(name).await {
            Ok(class) => Ok(Some(class)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.control.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MachineStatus,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_provider_id(&self, namespace: &str, name: &str, provider_id: &str) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "providerID": provider_id } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn merge_machine_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: serde_json::Value,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let machine = api.get(name).await?;
        let mut finalizers = machine.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MACHINE_FINALIZER.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.control.clone(), namespace);
        let machine = match api.get(name).await {
            Ok(m) => m,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = machine
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != MACHINE_FINALIZER)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
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

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.target.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared context of the machine controller.
pub struct Context {
    /// Kubernetes operations seam
    pub kube: Arc<dyn MachineClient>,
    /// Drain engine's Kubernetes seam (target cluster)
    pub drain: Arc<dyn DrainClient>,
    /// Cloud-provider driver
    pub driver: Arc<dyn Driver>,
    /// Event sink
    pub events: EventSink,
    /// Behavioral settings
    pub settings: Settings,
    /// Safety freeze flag; reconciles are no-ops while set
    pub frozen: Arc<AtomicBool>,
}

impl Context {
    /// True while the safety controller has frozen all mutation.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Resolve the machine's class and credentials secret. A missing class
    /// or secret is a user error surfaced as a validation failure.
    pub async fn class_and_secret(
        &self,
        machine: &Machine,
    ) -> Result<(MachineClass, Option<Secret>)> {
        let namespace = machine.namespace().unwrap_or_default();
        let class_name = &machine.spec.class.name;
        let class = self
            .kube
            .get_machine_class(&namespace, class_name)
            .await?
            .ok_or_else(|| {
                Error::validation(
                    format!("machine/{}", machine.name_any()),
                    format!("machineClass {class_name} not found"),
                )
            })?;

        let secret = match &class.spec.secret_ref {
            Some(secret_ref) => {
                let secret_ns = secret_ref.namespace.as_deref().unwrap_or(&namespace);
                let secret = self
                    .kube
                    .get_secret(secret_ns, &secret_ref.name)
                    .await?
                    .ok_or_else(|| {
                        Error::validation(
                            format!("machine/{}", machine.name_any()),
                            format!("secret {}/{} not found", secret_ns, secret_ref.name),
                        )
                    })?;
                Some(secret)
            }
            None => None,
        };

        Ok((class, secret))
    }
}

/// Coarse deadline bounding one machine reconcile, drain included.
const RECONCILE_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Reconcile a single Machine.
///
/// Idempotent: re-running against unchanged cluster state performs no
/// mutations. Dispatches to the deletion ladder when a deletion timestamp
/// is present, otherwise to the creation/health flow. The whole reconcile
/// is bounded by [`RECONCILE_DEADLINE`]; drain and provider calls carry
/// their own sub-deadlines within it.
#[instrument(
    skip(machine, ctx),
    fields(
        machine = %machine.name_any(),
        phase = %machine.phase(),
    )
)]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    use futures::FutureExt;

    let inner = std::panic::AssertUnwindSafe(reconcile_inner(machine, ctx)).catch_unwind();
    match tokio::time::timeout(RECONCILE_DEADLINE, inner).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(Error::internal("machine", "reconcile panicked")),
        Err(_) => Err(Error::internal("machine", "reconcile exceeded its deadline")),
    }
}

async fn reconcile_inner(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    if ctx.is_frozen() {
        debug!("operations frozen, skipping reconcile");
        return Ok(crate::RetryPeriod::Long.action());
    }

    if machine.meta().deletion_timestamp.is_some() {
        return deletion::reconcile_deletion(&machine, &ctx).await;
    }

    // The finalizer must be durable before any provider call: a machine
    // deleted between VM creation and the first status write would
    // otherwise leak its VM.
    if !machine
        .finalizers()
        .iter()
        .any(|f| f == MACHINE_FINALIZER)
    {
        let namespace = machine.namespace().unwrap_or_default();
        info!("adding lifecycle finalizer");
        ctx.kube
            .add_finalizer(&namespace, &machine.name_any())
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    creation::reconcile_active(&machine, &ctx).await
}

/// Error policy for the machine controller: classify the failure into its
/// retry bucket and requeue.
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(machine = %machine.name_any(), "conflict, requeueing");
        return crate::RetryPeriod::Short.action();
    }
    error!(
        machine = %machine.name_any(),
        error = %error,
        "machine reconciliation failed"
    );
    error.retry_period().action()
}
