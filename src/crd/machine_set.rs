//! MachineSet Custom Resource Definition
//!
//! A MachineSet is a replica group bound to one immutable machine template
//! revision. The MachineSet controller holds `|active machines| == replicas`;
//! the MachineDeployment controller scales sets during rollouts.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::MachineSpec;

/// Label selector for the machines owned by a set.
///
/// Only equality matching is supported; the selector is always a label map
/// stamped onto the machines at creation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSelector {
    /// Labels a machine must carry to be owned by this set
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl MachineSetSelector {
    /// True when every selector label is present with the same value.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else {
            return self.match_labels.is_empty();
        };
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Template from which new machines are stamped.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Labels copied to each machine (must satisfy the selector)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations copied to each machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Machine spec each replica is created with
    pub spec: MachineSpec,
}

/// Specification for a MachineSet
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.sapcloud.io",
    version = "v1alpha1",
    kind = "MachineSet",
    plural = "machinesets",
    shortname = "ms",
    status = "MachineSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of active machines
    #[serde(default)]
    pub replicas: i32,

    /// Selector identifying this set's machines
    pub selector: MachineSetSelector,

    /// Template new machines are stamped from
    pub template: MachineTemplateSpec,

    /// Seconds a Running machine must stay ready to count as available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,
}

/// Summary of a machine that failed permanently under this set.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedMachineSummary {
    /// Machine name
    pub name: String,

    /// Provider error code, when one was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable description of the failure
    pub message: String,
}

/// Status for a MachineSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Machines currently matching the selector
    #[serde(default)]
    pub replicas: i32,

    /// Machines in Running or Available phase
    #[serde(default)]
    pub ready_replicas: i32,

    /// Ready machines that have satisfied minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// Generation observed when this status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Machines that failed permanently and await replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_machines: Vec<FailedMachineSummary>,
}

impl MachineSet {
    /// Desired replica count.
    pub fn replicas(&self) -> i32 {
        self.spec.replicas
    }

    /// Available replicas from the last written status.
    pub fn available_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.available_replicas)
            .unwrap_or(0)
    }

    /// True when the skip-update freeze label is present.
    pub fn skip_update(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(super::types::LABEL_KEY_SKIP_UPDATE))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
