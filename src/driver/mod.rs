//! Cloud-provider driver contract
//!
//! The driver is the plug-in seam between the machine lifecycle engine and
//! a concrete cloud. The core consumes this trait; it never implements a
//! provider. Drivers must be idempotent on a stable request key (the
//! machine name): the core retries freely and does not guarantee
//! exactly-once VM creation across controller crashes.
//!
//! Errors are typed by [`DriverErrorCode`]; the core dispatches on codes
//! only and never inspects messages.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Machine, MachineClass};

/// Typed provider error codes the core dispatches on.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum DriverErrorCode {
    /// The driver does not implement this operation
    Unimplemented,
    /// The VM exists but has not finished provider-side initialization;
    /// the core calls [`Driver::initialize_machine`] before using it
    Uninitialized,
    /// Provider is out of capacity or quota
    ResourceExhausted,
    /// Provider-side failure that may recover
    Internal,
    /// The VM does not exist
    NotFound,
    /// The provider call exceeded its deadline
    DeadlineExceeded,
}

/// Error returned by driver operations.
#[derive(Debug, Error)]
#[error("driver {code:?}: {message}")]
pub struct DriverError {
    /// Typed code the core dispatches on
    pub code: DriverErrorCode,
    /// Provider-supplied description, surfaced to events only
    pub message: String,
}

impl DriverError {
    /// Create a driver error with the given code and message.
    pub fn new(code: DriverErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result of a successful VM creation or status query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmHandle {
    /// Opaque provider identifier of the VM
    pub provider_id: String,
    /// Name the node will register with
    pub node_name: String,
}

/// One VM known to the provider, as listed by [`Driver::list_machines`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmListing {
    /// Opaque provider identifier of the VM
    pub provider_id: String,
    /// Machine name the VM is tagged with
    pub machine_name: String,
}

/// Provider-facing operations consumed by the lifecycle and safety
/// controllers.
///
/// Implementations must be reentrant and safe for parallel calls for
/// *different* machines; the core never issues two concurrent calls for the
/// same machine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create the VM backing `machine` from `class`, using the credentials
    /// in `secret`. Must be idempotent on the machine name.
    async fn create_machine<'a>(
        &'a self,
        machine: &'a Machine,
        class: &'a MachineClass,
        secret: Option<&'a Secret>,
    ) -> Result<VmHandle, DriverError>;

    /// Delete the VM backing `machine`. Deleting a VM that is already gone
    /// must return [`DriverErrorCode::NotFound`].
    async fn delete_machine<'a>(
        &'a self,
        machine: &'a Machine,
        class: &'a MachineClass,
        secret: Option<&'a Secret>,
    ) -> Result<(), DriverError>;

    /// Query whether the VM backing `machine` exists, and its identifiers.
    async fn get_machine_status<'a>(
        &'a self,
        machine: &'a Machine,
        class: &'a MachineClass,
        secret: Option<&'a Secret>,
    ) -> Result<VmHandle, DriverError>;

    /// Finish provider-side initialization of a VM that reported
    /// [`DriverErrorCode::Uninitialized`] at creation.
    async fn initialize_machine<'a>(
        &'a self,
        machine: &'a Machine,
        class: &'a MachineClass,
        secret: Option<&'a Secret>,
    ) -> Result<(), DriverError>;

    /// Map PersistentVolume specs to provider volume IDs, for the drain
    /// engine's detach wait.
    async fn get_volume_ids(
        &self,
        pv_specs: Vec<serde_json::Value>,
    ) -> Result<Vec<String>, DriverError>;

    /// List all VMs tagged with this cluster's identity, for the orphan
    /// sweeper.
    async fn list_machines<'a>(
        &'a self,
        class: &'a MachineClass,
        secret: Option<&'a Secret>,
    ) -> Result<Vec<VmListing>, DriverError>;
}

/// Driver used when the operator binary runs without an embedded
/// provider: every operation reports [`DriverErrorCode::Unimplemented`].
///
/// Real deployments construct the controllers from the library with their
/// provider's driver; the stock binary only manages objects whose flows
/// tolerate an unimplemented driver (creation proceeds per the
/// Unimplemented contract, VM operations surface as machine status).
pub struct UnimplementedDriver;

#[async_trait]
impl Driver for UnimplementedDriver {
    async fn create_machine<'a>(
        &'a self,
        _machine: &'a Machine,
        _class: &'a MachineClass,
        _secret: Option<&'a Secret>,
    ) -> Result<VmHandle, DriverError> {
        Err(DriverError::new(
            DriverErrorCode::Unimplemented,
            "no provider driver linked",
        ))
    }

    async fn delete_machine<'a>(
        &'a self,
        _machine: &'a Machine,
        _class: &'a MachineClass,
        _secret: Option<&'a Secret>,
    ) -> Result<(), DriverError> {
        Err(DriverError::new(
            DriverErrorCode::Unimplemented,
            "no provider driver linked",
        ))
    }

    async fn get_machine_status<'a>(
        &'a self,
        _machine: &'a Machine,
        _class: &'a MachineClass,
        _secret: Option<&'a Secret>,
    ) -> Result<VmHandle, DriverError> {
        Err(DriverError::new(
            DriverErrorCode::Unimplemented,
            "no provider driver linked",
        ))
    }

    async fn initialize_machine<'a>(
        &'a self,
        _machine: &'a Machine,
        _class: &'a MachineClass,
        _secret: Option<&'a Secret>,
    ) -> Result<(), DriverError> {
        Err(DriverError::new(
            DriverErrorCode::Unimplemented,
            "no provider driver linked",
        ))
    }

    async fn get_volume_ids(
        &self,
        _pv_specs: Vec<serde_json::Value>,
    ) -> Result<Vec<String>, DriverError> {
        Ok(vec![])
    }

    async fn list_machines<'a>(
        &'a self,
        _class: &'a MachineClass,
        _secret: Option<&'a Secret>,
    ) -> Result<Vec<VmListing>, DriverError> {
        Err(DriverError::new(
            DriverErrorCode::Unimplemented,
            "no provider driver linked",
        ))
    }
}
