//! Machine creation and health flow
//!
//! Reconciles machines without a deletion timestamp: ensures the provider
//! VM exists (creating or adopting it), tracks node join, and follows node
//! health with the Running/Unknown/Failed transitions.

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::crd::types::NODE_LABEL_KEY;
use crate::crd::{
    CurrentStatus, LastOperation, Machine, MachineClass, MachinePhase, MachineState,
    MachineStatus, OperationType,
};
use crate::driver::{DriverError, DriverErrorCode, VmHandle};
use crate::events::{actions, reasons};
use crate::machine::health;
use crate::machine::Context;
use crate::{Error, Result, RetryPeriod};

/// Reconcile a live (non-terminating) machine.
pub(super) async fn reconcile_active(machine: &Machine, ctx: &Context) -> Result<Action> {
    let (class, secret) = ctx.class_and_secret(machine).await?;

    if machine.spec.provider_id.is_none() {
        return ensure_vm(machine, ctx, &class, secret.as_ref()).await;
    }

    track_health(machine, ctx).await
}

/// True when the last recorded operation failed with `Uninitialized`, in
/// which case the VM must be initialized before it is treated as usable.
fn needs_initialization(machine: &Machine) -> bool {
    machine
        .status
        .as_ref()
        .and_then(|s| s.last_operation.as_ref())
        .and_then(|op| op.error_code.as_deref())
        == Some("Uninitialized")
}

/// Seconds elapsed since the machine object was created.
fn machine_age(machine: &Machine) -> chrono::Duration {
    machine
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| Utc::now() - t.0)
        .unwrap_or_else(chrono::Duration::zero)
}

/// True once provider creation has been failing longer than the creation
/// timeout; the machine is then declared Failed and replaced.
fn creation_timed_out(machine: &Machine, ctx: &Context) -> bool {
    let timeout = ctx
        .settings
        .creation_timeout(machine.spec.configuration.as_ref());
    machine_age(machine).num_seconds() as u64 > timeout.as_secs()
}

/// Make sure the provider VM exists: query first, then create. The query
/// distinguishes a retried creation (adopt the existing VM) from a fresh
/// one, so a controller crash between the provider call and the status
/// write never produces a second VM.
async fn ensure_vm(
    machine: &Machine,
    ctx: &Context,
    class: &MachineClass,
    secret: Option<&Secret>,
) -> Result<Action> {
    match ctx.driver.get_machine_status(machine, class, secret).await {
        Ok(handle) => {
            if needs_initialization(machine) {
                info!(machine = %machine.name_any(), "initializing provider VM");
                if let Err(e) = ctx.driver.initialize_machine(machine, class, secret).await {
                    return Err(record_creation_failure(machine, ctx, e).await?);
                }
            }
            adopt_vm(machine, ctx, &handle).await
        }
        Err(e)
            if matches!(
                e.code,
                DriverErrorCode::NotFound | DriverErrorCode::Unimplemented
            ) =>
        {
            create_vm(machine, ctx, class, secret).await
        }
        Err(e) => Err(record_creation_failure(machine, ctx, e).await?),
    }
}

/// Issue the provider create call and adopt the resulting VM.
async fn create_vm(
    machine: &Machine,
    ctx: &Context,
    class: &MachineClass,
    secret: Option<&Secret>,
) -> Result<Action> {
    info!(machine = %machine.name_any(), class = %class.name_any(), "creating machine on cloud provider");
    ctx.events
        .normal(
            &machine.object_ref(&()),
            reasons::MACHINE_CREATING,
            actions::CREATE,
            Some(format!("Creating machine on cloud provider with class {}", class.name_any())),
        )
        .await;

    match ctx.driver.create_machine(machine, class, secret).await {
        Ok(handle) => {
            ctx.events
                .normal(
                    &machine.object_ref(&()),
                    reasons::MACHINE_CREATED,
                    actions::CREATE,
                    Some(format!("Created machine on cloud provider: {}", handle.provider_id)),
                )
                .await;
            adopt_vm(machine, ctx, &handle).await
        }
        Err(e) => Err(record_creation_failure(machine, ctx, e).await?),
    }
}

/// Persist the provider identity and enter Pending until the node joins.
///
/// The provider ID is written once and never rewritten; adoption of an
/// already-known VM only refreshes the status record.
async fn adopt_vm(machine: &Machine, ctx: &Context, handle: &VmHandle) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    if machine.spec.provider_id.is_none() {
        ctx.kube
            .set_provider_id(&namespace, &name, &handle.provider_id)
            .await?;
    }
    if machine.node_name() != Some(handle.node_name.as_str()) {
        ctx.kube
            .merge_machine_labels(
                &namespace,
                &name,
                serde_json::json!({ NODE_LABEL_KEY: handle.node_name }),
            )
            .await?;
    }

    let status = MachineStatus {
        current_status: CurrentStatus::new(MachinePhase::Pending),
        last_operation: Some(LastOperation::new(
            "Created machine on cloud provider",
            MachineState::Successful,
            OperationType::Create,
        )),
        conditions: machine
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
    };
    ctx.kube
        .patch_machine_status(&namespace, &name, &status)
        .await?;

    Ok(RetryPeriod::Short.action())
}

/// Record a provider failure into the machine status and hand the typed
/// error back for the error policy to classify.
///
/// The phase moves to CrashLoopBackOff (retrying) or Failed (creation
/// timeout lapsed); the MachineSet controller replaces Failed machines.
async fn record_creation_failure(
    machine: &Machine,
    ctx: &Context,
    driver_error: DriverError,
) -> Result<Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let timed_out = matches!(
        driver_error.code,
        DriverErrorCode::Internal | DriverErrorCode::DeadlineExceeded
    ) && creation_timed_out(machine, ctx);

    let (phase, description) = if timed_out {
        (
            MachinePhase::Failed,
            format!(
                "Machine {name} failed to join the cluster in {}m. Operation: Create",
                ctx.settings
                    .creation_timeout(machine.spec.configuration.as_ref())
                    .as_secs()
                    / 60
            ),
        )
    } else {
        (
            MachinePhase::CrashLoopBackOff,
            format!("Provider error: {}", driver_error.message),
        )
    };

    let status = MachineStatus {
        current_status: CurrentStatus::new(phase),
        last_operation: Some(
            LastOperation::new(description, MachineState::Failed, OperationType::Create)
                .with_error_code(format!("{:?}", driver_error.code)),
        ),
        conditions: machine
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
    };
    ctx.kube
        .patch_machine_status(&namespace, &name, &status)
        .await?;

    if timed_out {
        warn!(machine = %name, "creation timeout exceeded, declaring machine Failed");
        ctx.events
            .warning(
                &machine.object_ref(&()),
                reasons::MACHINE_FAILED,
                actions::CREATE,
                Some(format!("Machine {name} failed to join within the creation timeout")),
            )
            .await;
    }

    Ok(Error::driver(name, driver_error.code, driver_error.message))
}

/// Follow the backing node's health once the VM exists.
async fn track_health(machine: &Machine, ctx: &Context) -> Result<Action> {
    let phase = machine.phase();

    // Failed machines are replaced by the MachineSet controller, never
    // repaired here.
    if phase == MachinePhase::Failed {
        return Ok(Action::await_change());
    }

    let Some(node_name) = machine.node_name() else {
        // VM exists but the provider never reported a node name; the node
        // cannot be tracked, only the creation timeout applies.
        if creation_timed_out(machine, ctx) {
            return declare_failed(machine, ctx, "no node registered for machine").await;
        }
        return Ok(RetryPeriod::Short.action());
    };

    let node = ctx.kube.get_node(node_name).await?;
    let disqualifying = ctx
        .settings
        .disqualifying_conditions(machine.spec.configuration.as_ref());
    let healthy = node
        .as_ref()
        .map(|n| health::is_node_healthy(n, &disqualifying))
        .unwrap_or(false);
    let joined = node.is_some();

    match (phase, healthy) {
        // Waiting for the node: join + readiness, bounded by the creation
        // timeout.
        (MachinePhase::Pending | MachinePhase::Available | MachinePhase::CrashLoopBackOff, true) => {
            transition(
                machine,
                ctx,
                node.as_ref(),
                MachinePhase::Running,
                format!("Machine {} successfully joined the cluster", machine.name_any()),
                MachineState::Successful,
                OperationType::Create,
            )
            .await?;
            ctx.events
                .normal(
                    &machine.object_ref(&()),
                    reasons::MACHINE_JOINED,
                    actions::RECONCILE,
                    Some(format!("Node {node_name} is Ready")),
                )
                .await;
            Ok(RetryPeriod::Short.action())
        }
        (MachinePhase::Pending | MachinePhase::CrashLoopBackOff, false) if joined => {
            // Node object exists but is not Ready yet.
            transition(
                machine,
                ctx,
                node.as_ref(),
                MachinePhase::Available,
                format!("Machine {} is waiting for node {node_name} to become Ready", machine.name_any()),
                MachineState::Processing,
                OperationType::Create,
            )
            .await?;
            Ok(RetryPeriod::Short.action())
        }
        (MachinePhase::Pending | MachinePhase::Available | MachinePhase::CrashLoopBackOff, false) => {
            if creation_timed_out(machine, ctx) {
                return declare_failed(machine, ctx, "node did not become Ready within the creation timeout")
                    .await;
            }
            Ok(RetryPeriod::Short.action())
        }

        (MachinePhase::Running, true) => Ok(Action::requeue(
            ctx.settings.machine_health_timeout,
        )),
        (MachinePhase::Running, false) => {
            transition(
                machine,
                ctx,
                node.as_ref(),
                MachinePhase::Unknown,
                format!(
                    "Machine {} is unhealthy - changing MachineState to Unknown",
                    machine.name_any()
                ),
                MachineState::Processing,
                OperationType::HealthCheck,
            )
            .await?;
            ctx.events
                .warning(
                    &machine.object_ref(&()),
                    reasons::MACHINE_UNHEALTHY,
                    actions::RECONCILE,
                    Some(format!("Node {node_name} is no longer healthy")),
                )
                .await;
            Ok(RetryPeriod::Short.action())
        }

        (MachinePhase::Unknown, true) => {
            transition(
                machine,
                ctx,
                node.as_ref(),
                MachinePhase::Running,
                format!("Machine {} is healthy again", machine.name_any()),
                MachineState::Successful,
                OperationType::HealthCheck,
            )
            .await?;
            Ok(RetryPeriod::Short.action())
        }
        (MachinePhase::Unknown, false) => {
            let unknown_since = machine
                .status
                .as_ref()
                .and_then(|s| s.current_status.last_update_time)
                .unwrap_or_else(Utc::now);
            let timeout = ctx
                .settings
                .health_timeout(machine.spec.configuration.as_ref());
            if (Utc::now() - unknown_since).num_seconds() as u64 > timeout.as_secs() {
                return declare_failed(
                    machine,
                    ctx,
                    &format!("machine unhealthy for more than {}m", timeout.as_secs() / 60),
                )
                .await;
            }
            Ok(RetryPeriod::Short.action())
        }

        // Unreachable arms kept total: Terminating is dispatched earlier,
        // Failed returned above.
        (MachinePhase::Terminating | MachinePhase::Failed, _) => Ok(Action::await_change()),
    }
}

/// Declare the machine Failed so the MachineSet controller replaces it.
async fn declare_failed(machine: &Machine, ctx: &Context, cause: &str) -> Result<Action> {
    warn!(machine = %machine.name_any(), cause, "declaring machine Failed");
    transition(
        machine,
        ctx,
        None,
        MachinePhase::Failed,
        format!("Machine {} failed: {cause}", machine.name_any()),
        MachineState::Failed,
        OperationType::HealthCheck,
    )
    .await?;
    ctx.events
        .warning(
            &machine.object_ref(&()),
            reasons::MACHINE_FAILED,
            actions::RECONCILE,
            Some(cause.to_string()),
        )
        .await;
    Ok(RetryPeriod::Medium.action())
}

/// Persist a phase transition, skipping the write when the phase and
/// description already match (reconcile storms otherwise feed themselves
/// through status watch events). When the backing node is at hand its
/// conditions are mirrored into the machine status.
async fn transition(
    machine: &Machine,
    ctx: &Context,
    node: Option<&k8s_openapi::api::core::v1::Node>,
    phase: MachinePhase,
    description: String,
    state: MachineState,
    op: OperationType,
) -> Result<()> {
    let unchanged = machine.status.as_ref().is_some_and(|s| {
        s.current_status.phase == phase
            && s.last_operation
                .as_ref()
                .is_some_and(|o| o.description == description)
    });
    if unchanged {
        return Ok(());
    }

    let conditions = match node {
        Some(node) => health::mirror_node_conditions(node),
        None => machine
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
    };
    let status = MachineStatus {
        current_status: CurrentStatus::new(phase),
        last_operation: Some(LastOperation::new(description, state, op)),
        conditions,
    };
    ctx.kube
        .patch_machine_status(
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            &status,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_support::*;
    use crate::machine::MockMachineClient;
    use crate::driver::MockDriver;
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn ready_node() -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn not_ready_node() -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "False".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_machine_is_created_and_adopted() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_set_provider_id()
            .times(1)
            .withf(|_, _, id| id == "test:///machine-0")
            .returning(|_, _, _| Ok(()));
        kube.expect_merge_machine_labels()
            .times(1)
            .returning(|_, _, labels| {
                assert_eq!(labels[NODE_LABEL_KEY], "node-0");
                Ok(())
            });
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| {
                status.current_status.phase == MachinePhase::Pending
                    && status
                        .last_operation
                        .as_ref()
                        .is_some_and(|op| op.description == "Created machine on cloud provider")
            })
            .returning(|_, _, _| Ok(()));

        let mut driver = MockDriver::new();
        driver
            .expect_get_machine_status()
            .returning(|_, _, _| Err(DriverError::new(DriverErrorCode::NotFound, "no vm")));
        driver.expect_create_machine().times(1).returning(|_, _, _| {
            Ok(VmHandle {
                provider_id: "test:///machine-0".into(),
                node_name: "node-0".into(),
            })
        });

        let ctx = context(kube, driver);
        let action = reconcile_active(&machine(), &ctx).await.unwrap();
        assert_eq!(action, RetryPeriod::Short.action());
    }

    #[tokio::test]
    async fn existing_vm_is_adopted_without_create() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_set_provider_id().times(1).returning(|_, _, _| Ok(()));
        kube.expect_merge_machine_labels().returning(|_, _, _| Ok(()));
        kube.expect_patch_machine_status().returning(|_, _, _| Ok(()));

        let mut driver = MockDriver::new();
        driver.expect_get_machine_status().returning(|_, _, _| {
            Ok(VmHandle {
                provider_id: "test:///machine-0".into(),
                node_name: "node-0".into(),
            })
        });
        driver.expect_create_machine().times(0);

        let ctx = context(kube, driver);
        reconcile_active(&machine(), &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn resource_exhausted_goes_to_crash_loop_with_long_retry() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| {
                status.current_status.phase == MachinePhase::CrashLoopBackOff
                    && status
                        .last_operation
                        .as_ref()
                        .is_some_and(|op| op.error_code.as_deref() == Some("ResourceExhausted"))
            })
            .returning(|_, _, _| Ok(()));

        let mut driver = MockDriver::new();
        driver
            .expect_get_machine_status()
            .returning(|_, _, _| Err(DriverError::new(DriverErrorCode::NotFound, "no vm")));
        driver.expect_create_machine().returning(|_, _, _| {
            Err(DriverError::new(
                DriverErrorCode::ResourceExhausted,
                "quota exceeded",
            ))
        });

        let ctx = context(kube, driver);
        let err = reconcile_active(&machine(), &ctx).await.unwrap_err();
        assert_eq!(err.retry_period(), RetryPeriod::Long);
    }

    #[tokio::test]
    async fn internal_error_past_creation_timeout_fails_the_machine() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| status.current_status.phase == MachinePhase::Failed)
            .returning(|_, _, _| Ok(()));

        let mut driver = MockDriver::new();
        driver
            .expect_get_machine_status()
            .returning(|_, _, _| Err(DriverError::new(DriverErrorCode::NotFound, "no vm")));
        driver
            .expect_create_machine()
            .returning(|_, _, _| Err(DriverError::new(DriverErrorCode::Internal, "boom")));

        let mut m = machine();
        m.metadata.creation_timestamp = Some(Time(Utc::now() - ChronoDuration::minutes(25)));

        let ctx = context(kube, driver);
        let err = reconcile_active(&m, &ctx).await.unwrap_err();
        assert_eq!(err.retry_period(), RetryPeriod::Medium);
    }

    #[tokio::test]
    async fn uninitialized_vm_is_initialized_on_the_next_cycle() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_set_provider_id().returning(|_, _, _| Ok(()));
        kube.expect_merge_machine_labels().returning(|_, _, _| Ok(()));
        kube.expect_patch_machine_status().returning(|_, _, _| Ok(()));

        let mut driver = MockDriver::new();
        driver.expect_get_machine_status().returning(|_, _, _| {
            Ok(VmHandle {
                provider_id: "test:///machine-0".into(),
                node_name: "node-0".into(),
            })
        });
        driver
            .expect_initialize_machine()
            .times(1)
            .returning(|_, _, _| Ok(()));

        // Last cycle recorded an Uninitialized failure.
        let mut m = machine();
        m.status = Some(MachineStatus {
            current_status: CurrentStatus::new(MachinePhase::CrashLoopBackOff),
            last_operation: Some(
                LastOperation::new(
                    "Provider error: VM instance could not be initialized",
                    MachineState::Failed,
                    OperationType::Create,
                )
                .with_error_code("Uninitialized"),
            ),
            conditions: vec![],
        });

        let ctx = context(kube, driver);
        reconcile_active(&m, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn pending_machine_goes_running_when_node_is_ready() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_get_node()
            .returning(|_| Ok(Some(ready_node())));
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| {
                status.current_status.phase == MachinePhase::Running
                    && status.last_operation.as_ref().is_some_and(|op| {
                        op.description == "Machine machine-0 successfully joined the cluster"
                    })
            })
            .returning(|_, _, _| Ok(()));

        let mut m = machine_with_node("node-0");
        m.spec.provider_id = Some("test:///machine-0".into());
        m.status = Some(MachineStatus {
            current_status: CurrentStatus::new(MachinePhase::Pending),
            last_operation: None,
            conditions: vec![],
        });

        let ctx = context(kube, MockDriver::new());
        reconcile_active(&m, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn running_machine_flaps_to_unknown_when_node_degrades() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_get_node()
            .returning(|_| Ok(Some(not_ready_node())));
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| status.current_status.phase == MachinePhase::Unknown)
            .returning(|_, _, _| Ok(()));

        let mut m = machine_with_node("node-0");
        m.spec.provider_id = Some("test:///machine-0".into());
        m.status = Some(MachineStatus {
            current_status: CurrentStatus::new(MachinePhase::Running),
            last_operation: None,
            conditions: vec![],
        });

        let ctx = context(kube, MockDriver::new());
        reconcile_active(&m, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_machine_recovers_to_running() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_get_node()
            .returning(|_| Ok(Some(ready_node())));
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| status.current_status.phase == MachinePhase::Running)
            .returning(|_, _, _| Ok(()));

        let mut m = machine_with_node("node-0");
        m.spec.provider_id = Some("test:///machine-0".into());
        m.status = Some(MachineStatus {
            current_status: CurrentStatus::new(MachinePhase::Unknown),
            last_operation: None,
            conditions: vec![],
        });

        let ctx = context(kube, MockDriver::new());
        reconcile_active(&m, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_past_health_timeout_becomes_failed() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_get_node()
            .returning(|_| Ok(Some(not_ready_node())));
        kube.expect_patch_machine_status()
            .times(1)
            .withf(|_, _, status| status.current_status.phase == MachinePhase::Failed)
            .returning(|_, _, _| Ok(()));

        let mut m = machine_with_node("node-0");
        m.spec.provider_id = Some("test:///machine-0".into());
        m.status = Some(MachineStatus {
            current_status: CurrentStatus {
                phase: MachinePhase::Unknown,
                last_update_time: Some(Utc::now() - ChronoDuration::minutes(15)),
            },
            last_operation: None,
            conditions: vec![],
        });

        let ctx = context(kube, MockDriver::new());
        reconcile_active(&m, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn healthy_running_machine_is_untouched() {
        let mut kube = MockMachineClient::new();
        expect_class(&mut kube);
        kube.expect_get_node()
            .returning(|_| Ok(Some(ready_node())));
        kube.expect_patch_machine_status().times(0);

        let mut m = machine_with_node("node-0");
        m.spec.provider_id = Some("test:///machine-0".into());
        m.status = Some(MachineStatus {
            current_status: CurrentStatus::new(MachinePhase::Running),
            last_operation: None,
            conditions: vec![],
        });

        let ctx = context(kube, MockDriver::new());
        reconcile_active(&m, &ctx).await.unwrap();
    }
}
