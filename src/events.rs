//! Kubernetes Event recording for the machinist controllers.
//!
//! A thin sink over `kube::runtime::events::Recorder`, shared by every
//! controller context. Emission is **fire-and-forget**: failures are
//! logged as warnings and never propagate — a failed event must never
//! break reconciliation. Tests run with a disabled sink instead of a mock;
//! nothing in the controllers branches on event delivery.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Event sink carried in every controller context.
///
/// Built over a real recorder in production, or disabled for tests and
/// dry runs. Events show up in `kubectl describe` on the resource they
/// are published against.
pub struct EventSink {
    recorder: Option<Recorder>,
}

impl EventSink {
    /// Sink reporting as `controller_name` (the Event's
    /// "reportingComponent", e.g. "machinist-machine-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Some(Recorder::new(client, reporter)),
        }
    }

    /// Sink that drops every event. Used by tests.
    pub fn disabled() -> Self {
        Self { recorder: None }
    }

    /// Publish a Normal event on the given resource.
    pub async fn normal(
        &self,
        resource_ref: &ObjectReference,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource_ref, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a Warning event on the given resource.
    pub async fn warning(
        &self,
        resource_ref: &ObjectReference,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource_ref, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Machine lifecycle events
    /// Provider VM creation issued
    pub const MACHINE_CREATING: &str = "MachineCreating";
    /// Provider VM created, waiting for node join
    pub const MACHINE_CREATED: &str = "MachineCreated";
    /// Machine joined the cluster and is Running
    pub const MACHINE_JOINED: &str = "MachineJoined";
    /// Machine health flapped to Unknown
    pub const MACHINE_UNHEALTHY: &str = "MachineUnhealthy";
    /// Machine declared Failed (creation or health timeout)
    pub const MACHINE_FAILED: &str = "MachineFailed";
    /// Machine deletion initiated
    pub const MACHINE_DELETING: &str = "MachineDeleting";
    /// Node drain completed
    pub const DRAIN_SUCCEEDED: &str = "DrainSucceeded";
    /// Node drain failed or force-continued
    pub const DRAIN_FAILED: &str = "DrainFailed";

    // Scaling and rollout events
    /// MachineSet scaled up or down
    pub const SCALING_MACHINE_SET: &str = "ScalingMachineSet";
    /// Machine ownership transferred to the new MachineSet (in-place)
    pub const OWNERSHIP_TRANSFERRED: &str = "OwnershipTransferred";
    /// Machine selected for in-place update
    pub const SELECTED_FOR_UPDATE: &str = "SelectedForUpdate";
    /// The node agent reported a failed in-place update
    pub const NODE_UPDATE_FAILED: &str = "NodeUpdateFailed";
    /// Rollout finished, old MachineSets cleaned up
    pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a provider VM
    pub const CREATE: &str = "Create";
    /// Deleting a machine, VM or node
    pub const DELETE: &str = "Delete";
    /// Draining a node
    pub const DRAIN: &str = "Drain";
    /// Scaling a MachineSet
    pub const SCALE: &str = "Scale";
    /// Rolling out a template change
    pub const ROLLOUT: &str = "Rollout";
}
