//! API-server health gate
//!
//! Probes control- and target-cluster API reachability on a fixed period.
//! After three consecutive failed probes the gate freezes all mutation:
//! every reconciler checks the shared flag first and returns a long-retry
//! no-op while it is set. The gate unfreezes as soon as a probe succeeds
//! on both servers.
//!
//! Freezing on sustained unreachability keeps the controllers from acting
//! on a stale cache: a partitioned controller that kept mutating provider
//! state could delete VMs for machines it merely cannot see.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::settings::Settings;

/// Consecutive probe failures before the gate freezes.
pub const FREEZE_AFTER_FAILURES: u32 = 3;

/// Reachability probes against both API servers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiServerProbe: Send + Sync {
    /// True when the control-cluster API answers.
    async fn control_healthy(&self) -> bool;

    /// True when the target-cluster API answers.
    async fn target_healthy(&self) -> bool;
}

/// Production probe using the version endpoint, the cheapest
/// authenticated round-trip the API server offers.
pub struct ApiServerProbeImpl {
    control: Client,
    target: Client,
}

impl ApiServerProbeImpl {
    /// Wrap the control-cluster and target-cluster clients.
    pub fn new(control: Client, target: Client) -> Self {
        Self { control, target }
    }
}

#[async_trait]
impl ApiServerProbe for ApiServerProbeImpl {
    async fn control_healthy(&self) -> bool {
        self.control.apiserver_version().await.is_ok()
    }

    async fn target_healthy(&self) -> bool {
        self.target.apiserver_version().await.is_ok()
    }
}

/// Freeze-flag state machine, separated from the timer loop so the
/// transitions are testable.
pub struct HealthGate {
    frozen: Arc<AtomicBool>,
    consecutive_failures: u32,
}

impl HealthGate {
    /// Create a gate driving the given shared freeze flag.
    pub fn new(frozen: Arc<AtomicBool>) -> Self {
        Self {
            frozen,
            consecutive_failures: 0,
        }
    }

    /// Feed one probe result pair into the gate.
    pub fn observe(&mut self, control_ok: bool, target_ok: bool) {
        if control_ok && target_ok {
            self.consecutive_failures = 0;
            if self.frozen.swap(false, Ordering::SeqCst) {
                info!("API servers reachable again, unfreezing operations");
            }
            return;
        }

        self.consecutive_failures += 1;
        warn!(
            control_ok,
            target_ok,
            consecutive = self.consecutive_failures,
            "API server probe failed"
        );
        if self.consecutive_failures >= FREEZE_AFTER_FAILURES
            && !self.frozen.swap(true, Ordering::SeqCst)
        {
            warn!("freezing all machine operations until API servers recover");
        }
    }

    /// True while mutation is frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}

/// Periodic probe loop; runs until the process shuts down.
pub async fn run_apiserver_gate(
    probe: Arc<dyn ApiServerProbe>,
    frozen: Arc<AtomicBool>,
    settings: Settings,
) {
    let mut gate = HealthGate::new(frozen);
    let mut interval =
        tokio::time::interval(settings.machine_safety_apiserver_check_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let control_ok = probe.control_healthy().await;
        let target_ok = probe.target_healthy().await;
        debug!(control_ok, target_ok, "API server probe");
        gate.observe(control_ok, target_ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (HealthGate, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (HealthGate::new(flag.clone()), flag)
    }

    #[test]
    fn healthy_probes_never_freeze() {
        let (mut gate, flag) = gate();
        for _ in 0..10 {
            gate.observe(true, true);
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn freezes_only_after_three_consecutive_failures() {
        let (mut gate, flag) = gate();

        gate.observe(false, true);
        gate.observe(false, true);
        assert!(!flag.load(Ordering::SeqCst));

        gate.observe(false, true);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn intermittent_failures_reset_the_counter() {
        let (mut gate, flag) = gate();

        gate.observe(false, true);
        gate.observe(false, true);
        gate.observe(true, true);
        gate.observe(false, true);
        gate.observe(false, true);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn recovery_unfreezes_immediately() {
        let (mut gate, flag) = gate();
        for _ in 0..3 {
            gate.observe(false, false);
        }
        assert!(flag.load(Ordering::SeqCst));

        gate.observe(true, true);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn either_server_failing_counts() {
        let (mut gate, flag) = gate();
        gate.observe(true, false);
        gate.observe(false, true);
        gate.observe(true, false);
        assert!(flag.load(Ordering::SeqCst));
    }
}
