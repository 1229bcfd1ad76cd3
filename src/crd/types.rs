//! Supporting types shared by the machine CRDs
//!
//! Phases, operation bookkeeping, conditions, and the label/annotation/taint
//! vocabulary that forms the contract between the controllers and the
//! external node-update agent.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Label / annotation / taint contract
// =============================================================================

/// Machine label naming the Node backing it. Set once the provider reports
/// a node name; drain and health tracking resolve the Node through it.
pub const NODE_LABEL_KEY: &str = "node";

/// Node/Machine label marking a machine as updatable by the node agent.
pub const LABEL_KEY_CANDIDATE_FOR_UPDATE: &str = "node.machine.sapcloud.io/candidate-for-update";

/// Node/Machine label telling the node agent to cordon, drain and update.
pub const LABEL_KEY_SELECTED_FOR_UPDATE: &str = "node.machine.sapcloud.io/selected-for-update";

/// Node label the agent sets when it finishes: "successful" or "failed".
pub const LABEL_KEY_UPDATE_RESULT: &str = "node.machine.sapcloud.io/update-result";

/// Value of [`LABEL_KEY_UPDATE_RESULT`] after a successful node update.
pub const UPDATE_RESULT_SUCCESSFUL: &str = "successful";

/// Value of [`LABEL_KEY_UPDATE_RESULT`] after a failed node update.
pub const UPDATE_RESULT_FAILED: &str = "failed";

/// Node label the agent sets once its drain phase completed.
pub const LABEL_KEY_DRAIN_SUCCESSFUL: &str = "node.machine.sapcloud.io/drain-successful";

/// MachineSet label blocking the MachineSet controller from scaling the set
/// up while its machines are being updated in place.
pub const LABEL_KEY_SKIP_UPDATE: &str = "machine.sapcloud.io/skip-update";

/// Machine annotation holding the deletion priority (lower deletes first).
pub const PRIORITY_ANNOTATION: &str = "machinepriority.machine.sapcloud.io";

/// Default machine priority stamped on newly created machines.
pub const DEFAULT_PRIORITY: i32 = 3;

/// Machine label demoting drain errors to warnings and shortening budgets.
pub const FORCE_DELETION_LABEL: &str = "force-deletion";

/// Node annotation read by cluster-autoscaler to prevent scale-down.
pub const AUTOSCALER_SCALE_DOWN_DISABLED: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

/// Provenance marker: the scale-down annotation was added by this operator,
/// so only operator-added annotations are removed after rollout.
pub const AUTOSCALER_SCALE_DOWN_DISABLED_BY_MCM: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled-by-mcm";

/// Value written for both autoscaler annotations.
pub const AUTOSCALER_ANNOTATION_VALUE: &str = "true";

/// Taint placed on nodes backing old MachineSets during a rollout.
pub const PREFER_NO_SCHEDULE_TAINT: &str = "deployment.machine.sapcloud.io/prefer-no-schedule";

/// Read-only taint gating Ready evaluation of freshly joined nodes.
pub const CRITICAL_COMPONENTS_NOT_READY_TAINT: &str =
    "node.gardener.cloud/critical-components-not-ready";

/// Label carrying the hash of the machine template a machine was built from.
pub const MACHINE_TEMPLATE_HASH_LABEL: &str = "machine-template-hash";

// =============================================================================
// Machine phases and operations
// =============================================================================

/// Lifecycle phase of a Machine.
///
/// Phases advance monotonically except `Unknown` ↔ `Running` on health
/// flaps and `CrashLoopBackOff` → `Pending` once the provider recovers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// VM creation issued, node has not joined yet
    #[default]
    Pending,
    /// Node joined but not yet past the readiness gates
    Available,
    /// Node is Ready and healthy
    Running,
    /// Node health is flapping or unobservable
    Unknown,
    /// Machine gave up (creation or health timeout); will be replaced
    Failed,
    /// Provider keeps failing creation; retrying with backoff
    CrashLoopBackOff,
    /// Deletion timestamp set, the deletion ladder is running
    Terminating,
}

impl MachinePhase {
    /// True while the machine counts against the replica invariant.
    /// Failed and Terminating machines are replaced, not repaired.
    pub fn is_active(self) -> bool {
        !matches!(self, MachinePhase::Failed | MachinePhase::Terminating)
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Available => write!(f, "Available"),
            Self::Running => write!(f, "Running"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Failed => write!(f, "Failed"),
            Self::CrashLoopBackOff => write!(f, "CrashLoopBackOff"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Progress state of the last operation attempted on a machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineState {
    /// Operation is underway; the reconciler will resume it
    #[default]
    Processing,
    /// Operation finished
    Successful,
    /// Operation failed; the description embeds the cause
    Failed,
}

/// Kind of the last operation attempted on a machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationType {
    /// Provider VM creation and node join
    #[default]
    Create,
    /// Label/spec propagation
    Update,
    /// Periodic health evaluation
    HealthCheck,
    /// The deletion ladder
    Delete,
}

/// Resume point within the machine deletion ladder.
///
/// Persisted explicitly in `lastOperation.step` so a controller restart
/// resumes exactly where the previous process stopped. The human-readable
/// description is stamped alongside; it is never parsed except by
/// [`DeletionStep::from_description`] for statuses written by builds that
/// predate the explicit field.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionStep {
    /// Confirm whether the provider VM still exists
    GetVmStatus,
    /// Cordon and drain the backing node
    InitiateDrain,
    /// Wait for volume attachments to detach from the node
    DelVolumesAttachments,
    /// Ask the driver to delete the VM
    InitiateVmDeletion,
    /// Delete the Node object
    InitiateNodeDeletion,
    /// Remove the lifecycle finalizer; terminal
    InitiateFinalizerRemoval,
}

impl DeletionStep {
    /// Sentinel phrase embedded in `lastOperation.description` for this step.
    pub fn sentinel(self) -> &'static str {
        match self {
            Self::GetVmStatus => "Set machine status to termination. Now, getting VM Status",
            Self::InitiateDrain => "Initiate node drain",
            Self::DelVolumesAttachments => "Initiate delete of volume attachments",
            Self::InitiateVmDeletion => "Initiate VM deletion",
            Self::InitiateNodeDeletion => "Initiate node deletion",
            Self::InitiateFinalizerRemoval => "Initiate removal of finalizer",
        }
    }

    /// Recover the resume point from a description written by an older
    /// build without the explicit `step` field. The single place substring
    /// decoding is allowed.
    pub fn from_description(description: &str) -> Option<Self> {
        // Later steps first: descriptions may embed the next step after a
        // completed earlier one ("Drain successful. Initiate VM deletion").
        [
            Self::InitiateFinalizerRemoval,
            Self::InitiateNodeDeletion,
            Self::InitiateVmDeletion,
            Self::DelVolumesAttachments,
            Self::InitiateDrain,
            Self::GetVmStatus,
        ]
        .into_iter()
        .find(|step| description.contains(step.sentinel()))
    }
}

/// Record of the most recent operation on a machine.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human-readable description, includes the step sentinel
    pub description: String,

    /// Typed provider error code, when the operation failed on the driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// When this record was last written
    pub last_update_time: DateTime<Utc>,

    /// Progress state of the operation
    pub state: MachineState,

    /// Kind of operation
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// Explicit resume point of the deletion ladder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<DeletionStep>,
}

impl LastOperation {
    /// A fresh record with the current timestamp and no error code.
    pub fn new(description: impl Into<String>, state: MachineState, op: OperationType) -> Self {
        Self {
            description: description.into(),
            error_code: None,
            last_update_time: Utc::now(),
            state,
            operation_type: op,
            step: None,
        }
    }

    /// Attach the explicit deletion resume point.
    pub fn with_step(mut self, step: DeletionStep) -> Self {
        self.step = Some(step);
        self
    }

    /// Attach a provider error code.
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// The deletion resume point, from the explicit field when present and
    /// otherwise recovered from the description.
    pub fn deletion_step(&self) -> Option<DeletionStep> {
        self.step
            .or_else(|| DeletionStep::from_description(&self.description))
    }
}

/// Phase snapshot of a machine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStatus {
    /// Lifecycle phase
    pub phase: MachinePhase,

    /// When the phase last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl CurrentStatus {
    /// A snapshot of `phase` stamped now.
    pub fn new(phase: MachinePhase) -> Self {
        Self {
            phase,
            last_update_time: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. Ready, Progressing, Available)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

// =============================================================================
// Rollout arithmetic
// =============================================================================

/// An absolute count or a percentage of the desired replica count.
///
/// Used by `maxSurge` / `maxUnavailable`. Percentages resolve against the
/// desired replicas; surge rounds up, unavailability rounds down.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum IntOrPercent {
    /// Absolute machine count
    Int(i32),
    /// Percentage string such as "25%"
    Percent(String),
}

impl Default for IntOrPercent {
    fn default() -> Self {
        IntOrPercent::Int(0)
    }
}

impl IntOrPercent {
    /// Resolve against `total` desired replicas. Percentages round up when
    /// `round_up`, down otherwise. Malformed percentages are a validation
    /// error rather than a silent zero.
    pub fn resolve(&self, total: i32, round_up: bool) -> crate::Result<i32> {
        match self {
            IntOrPercent::Int(v) => Ok(*v),
            IntOrPercent::Percent(s) => {
                let digits = s.strip_suffix('%').ok_or_else(|| {
                    crate::Error::validation("intOrPercent", format!("not a percentage: {s:?}"))
                })?;
                let pct: i64 = digits.trim().parse().map_err(|_| {
                    crate::Error::validation("intOrPercent", format!("not a percentage: {s:?}"))
                })?;
                let scaled = pct * total as i64;
                let resolved = if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                };
                Ok(resolved as i32)
            }
        }
    }
}
