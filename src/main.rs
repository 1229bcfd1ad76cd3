//! Machinist - Kubernetes operator managing machine fleets

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Config, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use machinist::crd::types::NODE_LABEL_KEY;
use machinist::crd::{Machine, MachineClass, MachineDeployment, MachineSet};
use machinist::driver::{Driver, UnimplementedDriver};
use machinist::events::EventSink;
use machinist::settings::Settings;
use machinist::{deployment, machine, machineset, safety};

/// Machinist - fleet-lifecycle operator reconciling declarative machine
/// pools against cloud-provider VMs and cluster nodes
#[derive(Parser, Debug)]
#[command(name = "machinist", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace the machine CRDs live in
    #[arg(long, env = "MACHINIST_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Kubeconfig for the target cluster (nodes/pods); defaults to the
    /// control cluster
    #[arg(long, env = "TARGET_KUBECONFIG")]
    target_kubeconfig: Option<std::path::PathBuf>,

    /// Seconds before a machine stuck in creation is declared Failed
    #[arg(long, default_value = "1200")]
    machine_creation_timeout_secs: u64,

    /// Seconds a machine may stay unhealthy before it is declared Failed
    #[arg(long, default_value = "600")]
    machine_health_timeout_secs: u64,

    /// Seconds budgeted for a node drain before force-continuing
    #[arg(long, default_value = "300")]
    machine_drain_timeout_secs: u64,

    /// Seconds between orphan-VM sweeps
    #[arg(long, default_value = "1800")]
    machine_safety_orphan_vms_period_secs: u64,

    /// Seconds between API-server reachability probes
    #[arg(long, default_value = "60")]
    machine_safety_apiserver_check_period_secs: u64,

    /// Per-pod eviction retry cap during drain
    #[arg(long, default_value = "10")]
    max_evict_retries: u32,

    /// Comma-separated node condition types that disqualify a node from
    /// being healthy
    #[arg(
        long,
        default_value = "KernelDeadlock,ReadonlyFilesystem,DiskPressure,NetworkUnavailable"
    )]
    node_conditions: String,

    /// Annotate nodes against cluster-autoscaler scale-down during rollouts
    #[arg(long, default_value = "true")]
    autoscaler_scale_down_annotation_during_rollout: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            namespace: self.namespace.clone(),
            machine_creation_timeout: Duration::from_secs(self.machine_creation_timeout_secs),
            machine_health_timeout: Duration::from_secs(self.machine_health_timeout_secs),
            machine_drain_timeout: Duration::from_secs(self.machine_drain_timeout_secs),
            machine_safety_orphan_vms_period: Duration::from_secs(
                self.machine_safety_orphan_vms_period_secs,
            ),
            machine_safety_apiserver_check_period: Duration::from_secs(
                self.machine_safety_apiserver_check_period_secs,
            ),
            max_evict_retries: self.max_evict_retries,
            node_conditions: self
                .node_conditions
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            autoscaler_scale_down_annotation_during_rollout: self
                .autoscaler_scale_down_annotation_during_rollout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crds = [
            serde_yaml::to_string(&MachineClass::crd())?,
            serde_yaml::to_string(&Machine::crd())?,
            serde_yaml::to_string(&MachineSet::crd())?,
            serde_yaml::to_string(&MachineDeployment::crd())?,
        ];
        println!("{}", crds.join("---\n"));
        return Ok(());
    }

    let settings = cli.settings();
    tracing::info!(namespace = %settings.namespace, "machinist starting");

    let control = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create control-cluster client: {e}"))?;
    let target = match &cli.target_kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("failed to read target kubeconfig: {e}"))?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?;
            Client::try_from(config)
                .map_err(|e| anyhow::anyhow!("failed to create target-cluster client: {e}"))?
        }
        None => control.clone(),
    };

    // The stock binary ships without an embedded provider; deployments
    // embed their driver through the library API.
    let driver: Arc<dyn Driver> = Arc::new(UnimplementedDriver);
    tracing::warn!("no provider driver embedded, provider operations will report Unimplemented");

    run_controllers(control, target, driver, settings).await;

    tracing::info!("machinist shutting down");
    Ok(())
}

/// Wire one controller per resource kind plus the safety loops, and run
/// them until shutdown.
async fn run_controllers(
    control: Client,
    target: Client,
    driver: Arc<dyn Driver>,
    settings: Settings,
) {
    let frozen = Arc::new(AtomicBool::new(false));
    let namespace = settings.namespace.clone();

    let machines: Api<Machine> = Api::namespaced(control.clone(), &namespace);
    let machine_sets: Api<MachineSet> = Api::namespaced(control.clone(), &namespace);
    let deployments: Api<MachineDeployment> = Api::namespaced(control.clone(), &namespace);
    let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(target.clone());

    // Machine controller, re-reconciling machines on events of their
    // backing nodes.
    let machine_ctx = Arc::new(machine::Context {
        kube: Arc::new(machine::MachineClientImpl::new(
            control.clone(),
            target.clone(),
        )),
        drain: Arc::new(machinist::drain::DrainClientImpl::new(target.clone())),
        driver: driver.clone(),
        events: EventSink::new(control.clone(), "machinist-machine-controller"),
        settings: settings.clone(),
        frozen: frozen.clone(),
    });
    let machine_controller = Controller::new(machines.clone(), WatcherConfig::default());
    let machine_store = machine_controller.store();
    let machine_ns = namespace.clone();
    let machine_controller = machine_controller
        .watches(nodes, WatcherConfig::default(), move |node| {
            let node_name = node.name_any();
            machine_store
                .state()
                .iter()
                .filter(|m| {
                    m.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(NODE_LABEL_KEY))
                        .map(String::as_str)
                        == Some(node_name.as_str())
                })
                .map(|m| ObjectRef::new(&m.name_any()).within(&machine_ns))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, machine_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "machine reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "machine reconciliation error"),
            }
        });

    // MachineSet controller, owning Machines.
    let machineset_ctx = Arc::new(machineset::Context {
        kube: Arc::new(machineset::MachineSetClientImpl::new(control.clone())),
        events: EventSink::new(control.clone(), "machinist-machineset-controller"),
        settings: settings.clone(),
        frozen: frozen.clone(),
        expectations: Arc::new(machineset::Expectations::new()),
    });
    let machineset_controller = Controller::new(machine_sets.clone(), WatcherConfig::default())
        .owns(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(machineset::reconcile, machineset::error_policy, machineset_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "machineset reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "machineset reconciliation error"),
            }
        });

    // MachineDeployment controller, owning MachineSets.
    let deployment_ctx = Arc::new(deployment::Context {
        kube: Arc::new(deployment::RolloutClientImpl::new(
            control.clone(),
            target.clone(),
        )),
        events: EventSink::new(control.clone(), "machinist-deployment-controller"),
        settings: settings.clone(),
        frozen: frozen.clone(),
    });
    let deployment_controller = Controller::new(deployments, WatcherConfig::default())
        .owns(machine_sets, WatcherConfig::default())
        .shutdown_on_signal()
        .run(deployment::reconcile, deployment::error_policy, deployment_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "deployment reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "deployment reconciliation error"),
            }
        });

    // Safety loops.
    let orphan_sweeper = safety::run_orphan_sweeper(
        Arc::new(safety::OrphanClientImpl::new(control.clone())),
        driver,
        settings.clone(),
    );
    let apiserver_gate = safety::run_apiserver_gate(
        Arc::new(safety::ApiServerProbeImpl::new(control, target)),
        frozen,
        settings,
    );

    tracing::info!("starting controllers");
    tokio::select! {
        _ = machine_controller => tracing::info!("machine controller completed"),
        _ = machineset_controller => tracing::info!("machineset controller completed"),
        _ = deployment_controller => tracing::info!("deployment controller completed"),
        _ = orphan_sweeper => tracing::info!("orphan sweeper completed"),
        _ = apiserver_gate => tracing::info!("apiserver gate completed"),
    }
}
