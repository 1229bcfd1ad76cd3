//! Machinist - Kubernetes operator for declarative machine fleets
//!
//! Machinist reconciles a declarative spec of a cluster's worker nodes
//! against actual cloud-provider virtual machines and their representation
//! as cluster Node objects. Users declare a MachineDeployment (replica
//! count, template, rollout strategy); the operator materializes that into
//! MachineSets and individual Machines, each of which corresponds to one
//! provider VM and one Node.
//!
//! # Architecture
//!
//! Three cooperating reconcilers, one `kube::runtime::Controller` each:
//! - the Machine controller drives each machine through its lifecycle
//!   (provider VM creation, node join, health tracking, drain, deletion)
//! - the MachineSet controller maintains the replica invariant for one
//!   immutable template revision
//! - the MachineDeployment controller orchestrates rollouts across
//!   MachineSets, including in-place updates that transfer machine
//!   ownership between sets without replacing VMs
//!
//! A safety loop sweeps orphaned provider VMs and freezes all mutation
//! while either API server is unreachable.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Machine, MachineSet, MachineDeployment, MachineClass)
//! - [`driver`] - Cloud-provider driver contract (consumed, not implemented here)
//! - [`drain`] - Node cordon + pod eviction + volume-detach engine
//! - [`machine`] - Machine lifecycle controller
//! - [`machineset`] - MachineSet replica controller with expectations accounting
//! - [`deployment`] - MachineDeployment rollout orchestrator and status roll-up
//! - [`safety`] - Orphan-VM sweeper and API-server health gate
//! - [`events`] - Kubernetes Event recording
//! - [`settings`] - Controller-wide behavioral settings
//! - [`error`] - Error types and retry classification

#![deny(missing_docs)]

pub mod crd;
pub mod deployment;
pub mod drain;
pub mod driver;
pub mod error;
pub mod events;
pub mod machine;
pub mod machineset;
pub mod safety;
pub mod settings;

pub use error::{Error, RetryPeriod};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared constants
// =============================================================================

/// Finalizer placed on Machines so deletion is gated on the lifecycle engine.
pub const MACHINE_FINALIZER: &str = "machine.sapcloud.io/machine-controller-manager";

/// Field manager / controller name used for patches and event reporting.
pub const CONTROLLER_NAME: &str = "machinist";

/// API group of the machine CRDs.
pub const API_GROUP: &str = "machine.sapcloud.io";

/// API group/version of the machine CRDs.
pub const API_GROUP_VERSION: &str = "machine.sapcloud.io/v1alpha1";
