//! Custom Resource Definitions for the machinist operator
//!
//! Four kinds under `machine.sapcloud.io/v1alpha1`, all namespaced with the
//! status subresource enabled:
//!
//! - [`Machine`] - one provider VM and its intended Node
//! - [`MachineSet`] - a replica group bound to one template revision
//! - [`MachineDeployment`] - the user-facing pool declaration with a
//!   rollout strategy
//! - [`MachineClass`] - the opaque provider recipe machines are built from

mod machine;
mod machine_class;
mod machine_deployment;
mod machine_set;
pub mod types;

pub use machine::{ClassRef, Machine, MachineConfiguration, MachineSpec, MachineStatus};
pub use machine_class::{MachineClass, MachineClassSpec, SecretRef};
pub use machine_deployment::{
    MachineDeployment, MachineDeploymentSpec, MachineDeploymentStatus, MachineDeploymentStrategy,
    MachineDeploymentStrategyType, UpdateConfiguration,
};
pub use machine_set::{
    FailedMachineSummary, MachineSet, MachineSetSelector, MachineSetSpec, MachineSetStatus,
    MachineTemplateSpec,
};
pub use types::{
    Condition, ConditionStatus, CurrentStatus, DeletionStep, IntOrPercent, LastOperation,
    MachinePhase, MachineState, OperationType,
};
