//! Machine deletion ladder
//!
//! Once a deletion timestamp is present, the machine advances through an
//! ordered sequence of steps, each persisted to `lastOperation` before the
//! next runs:
//!
//! GetVmStatus → InitiateDrain → (DelVolumesAttachments) →
//! InitiateVmDeletion → InitiateNodeDeletion → InitiateFinalizerRemoval
//!
//! A normal, successful drain already awaited volume detachment and jumps
//! straight to VM deletion; the separate volume-attachment step runs only
//! after a force-continued drain, with a shorter budget. Each reconcile
//! executes exactly one step and requeues, so restarts resume mid-ladder.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::crd::types::FORCE_DELETION_LABEL;
use crate::crd::{
    CurrentStatus, DeletionStep, LastOperation, Machine, MachinePhase, MachineState,
    MachineStatus, OperationType,
};
use crate::drain::{attached_volume_ids, DrainEngine, DrainOptions, DrainOutcome};
use crate::driver::DriverErrorCode;
use crate::events::{actions, reasons};
use crate::machine::health;
use crate::machine::Context;
use crate::{Error, Result, RetryPeriod};

/// Minutes of sustained node unhealth that trigger force drain.
const FORCE_DRAIN_AFTER_UNHEALTHY_MINUTES: i64 = 5;

/// Reconcile a machine carrying a deletion timestamp.
pub(super) async fn reconcile_deletion(machine: &Machine, ctx: &Context) -> Result<Action> {
    if !machine
        .finalizers()
        .iter()
        .any(|f| f == crate::MACHINE_FINALIZER)
    {
        // Nothing gates deletion; the API server will collect the object.
        return Ok(Action::await_change());
    }

    let step = machine
        .status
        .as_ref()
        .and_then(|s| s.last_operation.as_ref())
        .filter(|op| op.operation_type == OperationType::Delete)
        .and_then(|op| op.deletion_step());

    match step {
        None => begin_termination(machine, ctx).await,
        Some(DeletionStep::GetVmStatus) => get_vm_status(machine, ctx).await,
        Some(DeletionStep::InitiateDrain) => initiate_drain(machine, ctx).await,
        Some(DeletionStep::DelVolumesAttachments) => del_volume_attachments(machine, ctx).await,
        Some(DeletionStep::InitiateVmDeletion) => initiate_vm_deletion(machine, ctx).await,
        Some(DeletionStep::InitiateNodeDeletion) => initiate_node_deletion(machine, ctx).await,
        Some(DeletionStep::InitiateFinalizerRemoval) => remove_finalizer(machine, ctx).await,
    }
}

/// Flip the phase to Terminating and stamp the first step.
async fn begin_termination(machine: &Machine, ctx: &Context) -> Result<Action> {
    info!(machine = %machine.name_any(), "beginning machine termination");
    ctx.events
        .normal(
            &machine.object_ref(&()),
            reasons::MACHINE_DELETING,
            actions::DELETE,
            None,
        )
        .await;
    persist_step(
        machine,
        ctx,
        DeletionStep::GetVmStatus,
        DeletionStep::GetVmStatus.sentinel().to_string(),
        MachineState::Processing,
    )
    .await?;
    Ok(RetryPeriod::Short.action())
}

/// Confirm whether the provider VM still exists; skip ahead when it is
/// already gone.
async fn get_vm_status(machine: &Machine, ctx: &Context) -> Result<Action> {
    let (class, secret) = ctx.class_and_secret(machine).await?;

    match ctx
        .driver
        .get_machine_status(machine, &class, secret.as_ref())
        .await
    {
        Ok(_) => {
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateDrain,
                DeletionStep::InitiateDrain.sentinel().to_string(),
                MachineState::Processing,
            )
            .await?;
        }
        Err(e) if e.code == DriverErrorCode::NotFound => {
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateVmDeletion,
                format!(
                    "VM not found on provider. {}",
                    DeletionStep::InitiateVmDeletion.sentinel()
                ),
                MachineState::Processing,
            )
            .await?;
        }
        // A driver without status support still gets the full ladder.
        Err(e) if e.code == DriverErrorCode::Unimplemented => {
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateDrain,
                DeletionStep::InitiateDrain.sentinel().to_string(),
                MachineState::Processing,
            )
            .await?;
        }
        Err(e) => {
            return Err(Error::driver(machine.name_any(), e.code, e.message));
        }
    }
    Ok(RetryPeriod::Short.action())
}

/// Drain precedence, derived from the lifecycle contract:
/// 1. no node label → skip drain entirely;
/// 2. force-deletion label, deletion older than the drain timeout, or node
///    unhealthy ≥ 5 min → force drain, errors demoted;
/// 3. otherwise a normal drain whose failures keep the machine at this
///    step.
async fn initiate_drain(machine: &Machine, ctx: &Context) -> Result<Action> {
    let Some(node_name) = machine.node_name() else {
        persist_step(
            machine,
            ctx,
            DeletionStep::InitiateVmDeletion,
            "Skipping drain as nodeName is not a valid one for machine. Initiate VM deletion"
                .to_string(),
            MachineState::Processing,
        )
        .await?;
        return Ok(RetryPeriod::Short.action());
    };

    let config = machine.spec.configuration.as_ref();
    let drain_timeout = ctx.settings.drain_timeout(config);

    let deletion_overdue = machine
        .meta()
        .deletion_timestamp
        .as_ref()
        .map(|t| (Utc::now() - t.0).num_seconds() as u64 > drain_timeout.as_secs())
        .unwrap_or(false);
    let node = ctx.kube.get_node(node_name).await?;
    let node_unhealthy_long = node
        .as_ref()
        .map(|n| health::unhealthy_beyond(n, FORCE_DRAIN_AFTER_UNHEALTHY_MINUTES))
        .unwrap_or(false);
    let force = machine.has_label(FORCE_DELETION_LABEL) || deletion_overdue || node_unhealthy_long;

    // Volumes whose detachment gates VM deletion, mapped through the driver.
    let tracked_volumes = match node.as_ref() {
        Some(node) => {
            let specs: Vec<serde_json::Value> = attached_volume_ids(node)
                .into_iter()
                .map(|name| serde_json::json!({ "name": name }))
                .collect();
            match ctx.driver.get_volume_ids(specs).await {
                Ok(ids) => ids.into_iter().collect::<BTreeSet<_>>(),
                Err(e) => {
                    warn!(machine = %machine.name_any(), error = %e, "could not map volume IDs, waiting on all attachments");
                    BTreeSet::new()
                }
            }
        }
        None => BTreeSet::new(),
    };

    let options = DrainOptions {
        timeout: drain_timeout,
        force,
        max_evict_retries: ctx.settings.evict_retries(config),
        ..DrainOptions::default()
    };
    let engine = DrainEngine::new(ctx.drain.as_ref(), options);

    match engine.run(node_name, &tracked_volumes).await {
        Ok(DrainOutcome::Drained) if !force => {
            ctx.events
                .normal(
                    &machine.object_ref(&()),
                    reasons::DRAIN_SUCCEEDED,
                    actions::DRAIN,
                    None,
                )
                .await;
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateVmDeletion,
                format!(
                    "Drain successful. {}",
                    DeletionStep::InitiateVmDeletion.sentinel()
                ),
                MachineState::Processing,
            )
            .await?;
        }
        Ok(_) => {
            // Force drain, or a drain that ran out of budget: volume
            // detachment gets one more bounded look as its own step.
            ctx.events
                .normal(
                    &machine.object_ref(&()),
                    reasons::DRAIN_SUCCEEDED,
                    actions::DRAIN,
                    Some("Force drain".to_string()),
                )
                .await;
            persist_step(
                machine,
                ctx,
                DeletionStep::DelVolumesAttachments,
                format!(
                    "Force Drain successful. {}",
                    DeletionStep::DelVolumesAttachments.sentinel()
                ),
                MachineState::Processing,
            )
            .await?;
        }
        Err(e) if force => {
            // Force deletion demotes drain errors to warnings.
            warn!(machine = %machine.name_any(), error = %e, "drain failed under force deletion, continuing");
            persist_step(
                machine,
                ctx,
                DeletionStep::DelVolumesAttachments,
                format!(
                    "Drain failed due to - {e}. However, since it's a force deletion shall continue deletion of VM. {}",
                    DeletionStep::DelVolumesAttachments.sentinel()
                ),
                MachineState::Processing,
            )
            .await?;
        }
        Err(e) => {
            ctx.events
                .warning(
                    &machine.object_ref(&()),
                    reasons::DRAIN_FAILED,
                    actions::DRAIN,
                    Some(e.to_string()),
                )
                .await;
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateDrain,
                format!(
                    "Drain failed due to - {e}. Will retry in next sync. {}",
                    DeletionStep::InitiateDrain.sentinel()
                ),
                MachineState::Failed,
            )
            .await?;
            return Err(e);
        }
    }
    Ok(RetryPeriod::Short.action())
}

/// Wait (briefly) for remaining volume attachments after a force-continued
/// drain, then move on regardless.
async fn del_volume_attachments(machine: &Machine, ctx: &Context) -> Result<Action> {
    if let Some(node_name) = machine.node_name() {
        let engine = DrainEngine::new(ctx.drain.as_ref(), DrainOptions::default());
        let detached = engine
            .wait_for_volume_detach(node_name, &BTreeSet::new(), Duration::from_secs(30))
            .await?;
        if !detached {
            warn!(machine = %machine.name_any(), "volumes still attached, proceeding with VM deletion");
        }
    }
    persist_step(
        machine,
        ctx,
        DeletionStep::InitiateVmDeletion,
        DeletionStep::InitiateVmDeletion.sentinel().to_string(),
        MachineState::Processing,
    )
    .await?;
    Ok(RetryPeriod::Short.action())
}

/// Ask the driver to delete the VM. A VM that is already gone counts as
/// deleted.
async fn initiate_vm_deletion(machine: &Machine, ctx: &Context) -> Result<Action> {
    let (class, secret) = ctx.class_and_secret(machine).await?;

    match ctx
        .driver
        .delete_machine(machine, &class, secret.as_ref())
        .await
    {
        Ok(()) => {}
        Err(e) if e.code == DriverErrorCode::NotFound => {}
        Err(e) => {
            persist_step(
                machine,
                ctx,
                DeletionStep::InitiateVmDeletion,
                format!(
                    "VM deletion failed due to - {}. Will retry in next sync. {}",
                    e.message,
                    DeletionStep::InitiateVmDeletion.sentinel()
                ),
                MachineState::Failed,
            )
            .await?;
            return Err(Error::driver(machine.name_any(), e.code, e.message));
        }
    }

    info!(machine = %machine.name_any(), "provider VM deleted");
    persist_step(
        machine,
        ctx,
        DeletionStep::InitiateNodeDeletion,
        format!(
            "VM deletion was successful. {}",
            DeletionStep::InitiateNodeDeletion.sentinel()
        ),
        MachineState::Processing,
    )
    .await?;
    Ok(RetryPeriod::Short.action())
}

/// Delete the Node object backing the machine, when one was registered.
async fn initiate_node_deletion(machine: &Machine, ctx: &Context) -> Result<Action> {
    if let Some(node_name) = machine.node_name() {
        ctx.kube.delete_node(node_name).await?;
    }
    persist_step(
        machine,
        ctx,
        DeletionStep::InitiateFinalizerRemoval,
        format!(
            "Node deletion was successful. {}",
            DeletionStep::InitiateFinalizerRemoval.sentinel()
        ),
        MachineState::Processing,
    )
    .await?;
    Ok(RetryPeriod::Short.action())
}

/// Remove the lifecycle finalizer; the API server then finishes deletion.
async fn remove_finalizer(machine: &Machine, ctx: &Context) -> Result<Action> {
    ctx.kube
        .remove_finalizer(
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
        )
        .await?;
    info!(machine = %machine.name_any(), "machine finalized");
    Ok(Action::await_change())
}

/// Persist the current ladder position: Terminating phase, the explicit
/// step enum, and the human-readable description embedding the sentinel.
async fn persist_step(
    machine: &Machine,
    ctx: &Context,
    step: DeletionStep,
    description: String,
    state: MachineState,
) -> Result<()> {
    let status = MachineStatus {
        current_status: CurrentStatus::new(MachinePhase::Terminating),
        last_operation: Some(
            LastOperation::new(description, state, OperationType::Delete).with_step(step),
        ),
        conditions: machine
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
    };
    ctx.kube
        .patch_machine_status(
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            &status,
        )
        .await
}
