//! Controller-wide behavioral settings
//!
//! Parsed from CLI flags/environment in `main.rs` and carried in every
//! controller context. Per-machine overrides from
//! [`crate::crd::MachineConfiguration`] take precedence where present.

use std::time::Duration;

use crate::crd::MachineConfiguration;

/// Behavioral knobs of the operator.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace the machine CRDs live in
    pub namespace: String,

    /// How long provider creation may keep failing, or a created VM may
    /// fail to join, before the machine is declared Failed
    pub machine_creation_timeout: Duration,

    /// How long a machine may stay Unknown before it is declared Failed
    pub machine_health_timeout: Duration,

    /// Budget for a node drain before force-continuing
    pub machine_drain_timeout: Duration,

    /// Period of the orphan-VM sweep
    pub machine_safety_orphan_vms_period: Duration,

    /// Period of the API-server reachability probe
    pub machine_safety_apiserver_check_period: Duration,

    /// Per-pod eviction retry cap during drain
    pub max_evict_retries: u32,

    /// Node condition types that disqualify a node from being healthy
    pub node_conditions: Vec<String>,

    /// Annotate nodes with the autoscaler scale-down-disabled annotation
    /// for the duration of a rollout
    pub autoscaler_scale_down_annotation_during_rollout: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            machine_creation_timeout: Duration::from_secs(20 * 60),
            machine_health_timeout: Duration::from_secs(10 * 60),
            machine_drain_timeout: Duration::from_secs(5 * 60),
            machine_safety_orphan_vms_period: Duration::from_secs(30 * 60),
            machine_safety_apiserver_check_period: Duration::from_secs(60),
            max_evict_retries: 10,
            node_conditions: vec![
                "KernelDeadlock".to_string(),
                "ReadonlyFilesystem".to_string(),
                "DiskPressure".to_string(),
                "NetworkUnavailable".to_string(),
            ],
            autoscaler_scale_down_annotation_during_rollout: true,
        }
    }
}

impl Settings {
    /// Drain timeout, honoring a per-machine override.
    pub fn drain_timeout(&self, config: Option<&MachineConfiguration>) -> Duration {
        config
            .and_then(|c| c.drain_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(self.machine_drain_timeout)
    }

    /// Health timeout, honoring a per-machine override.
    pub fn health_timeout(&self, config: Option<&MachineConfiguration>) -> Duration {
        config
            .and_then(|c| c.health_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(self.machine_health_timeout)
    }

    /// Creation timeout, honoring a per-machine override.
    pub fn creation_timeout(&self, config: Option<&MachineConfiguration>) -> Duration {
        config
            .and_then(|c| c.creation_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(self.machine_creation_timeout)
    }

    /// Eviction retry cap, honoring a per-machine override.
    pub fn evict_retries(&self, config: Option<&MachineConfiguration>) -> u32 {
        config
            .and_then(|c| c.max_evict_retries)
            .unwrap_or(self.max_evict_retries)
    }

    /// Disqualifying node conditions, honoring a per-machine override
    /// (comma-separated in the override).
    pub fn disqualifying_conditions(&self, config: Option<&MachineConfiguration>) -> Vec<String> {
        match config.and_then(|c| c.node_conditions.as_deref()) {
            Some(csv) => csv
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => self.node_conditions.clone(),
        }
    }
}
