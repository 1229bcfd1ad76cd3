//! MachineDeployment Custom Resource Definition
//!
//! The user-facing declaration of a worker pool: a machine template, a
//! replica count, and a rollout strategy. The deployment controller
//! materializes it into MachineSets and orchestrates template changes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine_set::{MachineSetSelector, MachineTemplateSpec};
use super::types::{Condition, IntOrPercent};

/// Rollout strategy kinds.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineDeploymentStrategyType {
    /// Scale old sets to zero, then bring up the new set
    Recreate,
    /// Classic surge-then-shrink replacement rollout
    #[default]
    RollingUpdate,
    /// Update nodes without replacing machines; ownership transfers between
    /// sets as the node agent finishes each node
    InPlaceUpdate,
}

/// Parameters shared by the rolling and in-place strategies.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfiguration {
    /// Extra machines allowed above the desired count during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrPercent>,

    /// Shortfall allowed below the desired count during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

/// Rollout strategy with per-strategy configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStrategy {
    /// Strategy kind
    #[serde(rename = "type", default)]
    pub type_: MachineDeploymentStrategyType,

    /// Surge/unavailability budgets for RollingUpdate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<UpdateConfiguration>,

    /// Surge/unavailability budgets for InPlaceUpdate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place_update: Option<UpdateConfiguration>,
}

impl MachineDeploymentStrategy {
    /// The budgets that apply to the configured strategy kind.
    pub fn update_configuration(&self) -> Option<&UpdateConfiguration> {
        match self.type_ {
            MachineDeploymentStrategyType::RollingUpdate => self.rolling_update.as_ref(),
            MachineDeploymentStrategyType::InPlaceUpdate => self.in_place_update.as_ref(),
            MachineDeploymentStrategyType::Recreate => None,
        }
    }
}

/// Specification for a MachineDeployment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.sapcloud.io",
    version = "v1alpha1",
    kind = "MachineDeployment",
    plural = "machinedeployments",
    shortname = "md",
    status = "MachineDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// Desired number of machines
    #[serde(default)]
    pub replicas: i32,

    /// Selector uniquely identifying this deployment's machines across the
    /// namespace; every MachineSet inherits it plus the template hash
    pub selector: MachineSetSelector,

    /// Template machines are stamped from
    pub template: MachineTemplateSpec,

    /// Rollout strategy
    #[serde(default)]
    pub strategy: MachineDeploymentStrategy,

    /// Seconds a Running machine must stay ready to count as available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    /// Old MachineSets kept around after rollout, oldest pruned first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// Pause rollout; only status is synced while paused
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Seconds without rollout progress before Progressing flips to
    /// ProgressDeadlineExceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<i32>,
}

impl MachineDeploymentSpec {
    /// Validate cross-field invariants of the spec.
    pub fn validate(&self) -> crate::Result<()> {
        if self.replicas < 0 {
            return Err(crate::Error::validation(
                "machinedeployment",
                "replicas must be non-negative",
            ));
        }
        if self.selector.match_labels.is_empty() {
            return Err(crate::Error::validation(
                "machinedeployment",
                "selector.matchLabels must not be empty",
            ));
        }
        if !self
            .selector
            .matches(Some(&self.template.labels))
        {
            return Err(crate::Error::validation(
                "machinedeployment",
                "template labels must satisfy the selector",
            ));
        }
        Ok(())
    }
}

/// Status for a MachineDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    /// Generation observed when this status was written
    #[serde(default)]
    pub observed_generation: i64,

    /// Machines across all owned sets
    #[serde(default)]
    pub replicas: i32,

    /// Machines on the current template revision
    #[serde(default)]
    pub updated_replicas: i32,

    /// Machines in Running or Available phase
    #[serde(default)]
    pub ready_replicas: i32,

    /// Ready machines that have satisfied minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// desired − available, floored at zero
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Bumped when a template-hash collision forces a new set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Progressing / Available / ReplicaFailure conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MachineDeployment {
    /// Resolved maxSurge for the configured strategy (rounds up).
    pub fn max_surge(&self) -> crate::Result<i32> {
        let Some(config) = self.spec.strategy.update_configuration() else {
            return Ok(0);
        };
        config
            .max_surge
            .as_ref()
            .map(|v| v.resolve(self.spec.replicas, true))
            .unwrap_or(Ok(0))
    }

    /// Resolved maxUnavailable for the configured strategy (rounds down).
    /// When both budgets resolve to zero the rollout would deadlock, so
    /// unavailability is bumped to one, matching upstream Deployment
    /// semantics.
    pub fn max_unavailable(&self) -> crate::Result<i32> {
        let Some(config) = self.spec.strategy.update_configuration() else {
            return Ok(0);
        };
        let surge = self.max_surge()?;
        let unavailable = config
            .max_unavailable
            .as_ref()
            .map(|v| v.resolve(self.spec.replicas, false))
            .unwrap_or(Ok(0))?
            .min(self.spec.replicas);
        if surge == 0 && unavailable == 0 {
            return Ok(1);
        }
        Ok(unavailable)
    }
}
