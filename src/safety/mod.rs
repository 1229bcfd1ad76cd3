//! Safety controllers
//!
//! Two background loops that protect the fleet rather than reconcile a
//! resource:
//!
//! - the orphan-VM sweeper periodically lists provider VMs tagged with the
//!   cluster identity and deletes any VM no Machine accounts for, so
//!   crashed creations cannot leak capacity forever;
//! - the API-server gate probes control- and target-cluster reachability
//!   and freezes all mutation while either is down, so the controllers do
//!   not act on a stale world view.

mod apiserver;
mod orphans;

pub use apiserver::{run_apiserver_gate, ApiServerProbe, ApiServerProbeImpl, HealthGate};
pub use orphans::{run_orphan_sweeper, sweep_orphans_once, OrphanClient, OrphanClientImpl};
