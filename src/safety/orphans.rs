//! Orphan-VM sweeper
//!
//! A provider VM is an orphan when no Machine accounts for it: its
//! provider ID is unknown and its machine tag does not name a live
//! Machine. Orphans appear when a controller crashes between VM creation
//! and the first status write, or when a user deletes a Machine object
//! with the finalizer forcibly stripped. The sweeper deletes them on a
//! slow cadence.
//!
//! Guard against racing an in-flight creation: a VM whose machine tag
//! names an existing Machine is never swept, except when that Machine is
//! Failed without a recorded provider ID — its VM can no longer be
//! adopted and the MachineSet controller is already replacing it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Machine, MachineClass, MachinePhase, MachineSpec};
use crate::driver::Driver;
use crate::settings::Settings;
use crate::Result;

/// Kubernetes reads the sweeper needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrphanClient: Send + Sync {
    /// List all MachineClasses in the namespace.
    async fn list_machine_classes(&self, namespace: &str) -> Result<Vec<MachineClass>>;

    /// List all Machines in the namespace.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>>;

    /// Get a Secret by name, None when absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Production implementation over the control-cluster client.
pub struct OrphanClientImpl {
    client: Client,
}

impl OrphanClientImpl {
    /// Wrap the control-cluster client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrphanClient for OrphanClientImpl {
    async fn list_machine_classes(&self, namespace: &str) -> Result<Vec<MachineClass>> {
        let api: Api<MachineClass> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Default::default()).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// One sweep across all machine classes. Returns how many VMs were
/// deleted. Per-class failures are logged and skipped; one misbehaving
/// provider must not stall the sweep of the others.
pub async fn sweep_orphans_once(
    kube: &dyn OrphanClient,
    driver: &dyn Driver,
    settings: &Settings,
) -> Result<usize> {
    let namespace = &settings.namespace;
    let machines = kube.list_machines(namespace).await?;

    let known_provider_ids: HashSet<&str> = machines
        .iter()
        .filter_map(|m| m.spec.provider_id.as_deref())
        .collect();
    let machines_by_name: BTreeMap<String, &Machine> = machines
        .iter()
        .map(|m| (m.name_any(), m))
        .collect();

    let classes = kube.list_machine_classes(namespace).await?;
    let mut deleted = 0;

    for class in &classes {
        let secret = match &class.spec.secret_ref {
            Some(secret_ref) => {
                let ns = secret_ref.namespace.as_deref().unwrap_or(namespace);
                kube.get_secret(ns, &secret_ref.name).await?
            }
            None => None,
        };

        let listings = match driver.list_machines(class, secret.as_ref()).await {
            Ok(listings) => listings,
            Err(e) => {
                warn!(class = %class.name_any(), error = %e, "provider VM listing failed, skipping class");
                continue;
            }
        };

        for listing in listings {
            if known_provider_ids.contains(listing.provider_id.as_str()) {
                continue;
            }
            let adoptable = match machines_by_name.get(&listing.machine_name) {
                // In-flight creation: the machine exists and may still
                // record this provider ID.
                Some(machine) => {
                    machine.spec.provider_id.is_some()
                        || machine.phase() != MachinePhase::Failed
                }
                None => false,
            };
            if adoptable {
                debug!(
                    vm = %listing.provider_id,
                    machine = %listing.machine_name,
                    "VM belongs to an in-flight creation, deferring"
                );
                continue;
            }

            info!(
                vm = %listing.provider_id,
                machine_tag = %listing.machine_name,
                class = %class.name_any(),
                "deleting orphan provider VM"
            );
            let synthetic = orphan_machine(&listing.machine_name, &listing.provider_id, class);
            if let Err(e) = driver.delete_machine(&synthetic, class, secret.as_ref()).await {
                warn!(vm = %listing.provider_id, error = %e, "orphan VM deletion failed");
                continue;
            }
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Synthetic machine object carrying just enough identity for the driver
/// to delete the VM.
fn orphan_machine(name: &str, provider_id: &str, class: &MachineClass) -> Machine {
    Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: class.namespace(),
            ..Default::default()
        },
        spec: MachineSpec {
            class: crate::crd::ClassRef {
                name: class.name_any(),
            },
            provider_id: Some(provider_id.to_string()),
            configuration: None,
        },
        status: None,
    }
}

/// Periodic sweep loop; runs until the process shuts down.
pub async fn run_orphan_sweeper(
    kube: Arc<dyn OrphanClient>,
    driver: Arc<dyn Driver>,
    settings: Settings,
) {
    let mut interval = tokio::time::interval(settings.machine_safety_orphan_vms_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match sweep_orphans_once(kube.as_ref(), driver.as_ref(), &settings).await {
            Ok(0) => debug!("orphan sweep clean"),
            Ok(deleted) => info!(deleted, "orphan sweep deleted VMs"),
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
    }
}
