//! Machine Custom Resource Definition
//!
//! A Machine is the declarative representation of one cloud-provider VM and
//! its intended cluster Node. The machine controller drives it through the
//! lifecycle phases; the MachineSet controller creates and deletes Machines
//! to hold the replica invariant.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, CurrentStatus, LastOperation, MachinePhase, DEFAULT_PRIORITY, NODE_LABEL_KEY,
    PRIORITY_ANNOTATION,
};

/// Reference to the MachineClass a machine is built from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    /// Name of the MachineClass in the machine's namespace
    pub name: String,
}

/// Per-machine overrides of the controller-wide lifecycle timeouts.
///
/// All fields optional; absent fields fall back to the controller flags.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfiguration {
    /// Budget for a node drain before force-continuing, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_seconds: Option<u64>,

    /// How long a machine may stay unhealthy before it is declared Failed,
    /// in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_timeout_seconds: Option<u64>,

    /// How long provider creation may keep failing before the machine is
    /// declared Failed, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timeout_seconds: Option<u64>,

    /// Per-pod eviction retry cap during drain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_evict_retries: Option<u32>,

    /// Comma-separated node condition types that disqualify a node from
    /// being considered healthy (e.g. "ReadonlyFilesystem,KernelDeadlock")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_conditions: Option<String>,
}

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.sapcloud.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    shortname = "mc",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.currentStatus.phase"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// The MachineClass describing how the provider should build the VM
    pub class: ClassRef,

    /// Opaque provider identifier of the VM. Assigned by the machine
    /// controller once the VM exists and never cleared afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,

    /// Per-machine lifecycle timeout overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<MachineConfiguration>,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Phase snapshot
    #[serde(default)]
    pub current_status: CurrentStatus,

    /// Record of the most recent operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Mirrored node conditions plus synthetic ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Machine {
    /// The machine's lifecycle phase, Pending when status is unset.
    pub fn phase(&self) -> MachinePhase {
        self.status
            .as_ref()
            .map(|s| s.current_status.phase)
            .unwrap_or_default()
    }

    /// Name of the backing Node, resolved through the node label.
    pub fn node_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NODE_LABEL_KEY))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Deletion priority from the priority annotation; lower deletes first.
    /// Unparseable or absent annotations fall back to the default.
    pub fn priority(&self) -> i32 {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PRIORITY_ANNOTATION))
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// True once a deletion timestamp is present.
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the machine counts against the replica invariant.
    pub fn is_active(&self) -> bool {
        !self.is_terminating() && self.phase().is_active()
    }

    /// True when the given label carries the value "true".
    pub fn has_label(&self, key: &str) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
