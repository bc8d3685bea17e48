//! hvnat
//!
//! Declares a single Hyper-V NAT network (internal virtual switch, gateway IP,
//! NetNat instance and static port mappings) from a JSON document and
//! reconciles the host to it.
//!
//! Reconciliation is clean-slate: every run first removes whatever exists
//! under the network's names, then recreates it in order. Running `apply`
//! twice converges on the same state, and a failed apply is rolled back by
//! running the same teardown again.
//!
//! # Example
//!
//! ```no_run
//! use hvnat::{PowerShellHost, Reconciler, ReconciliationConfig};
//!
//! let config = ReconciliationConfig::load("network.json")?;
//! let reconciler = Reconciler::new(PowerShellHost::new());
//!
//! let report = reconciler.apply(&config)?;
//! println!("{} port mappings applied", report.mappings_applied);
//! # Ok::<(), hvnat::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod hyperv;
pub mod plan;
pub mod reconcile;

pub use config::{Action, NetworkSpec, PortForwardingRule, Protocol, ReconciliationConfig, VmHint};
pub use error::{Error, Result};
pub use host::{DryRunHost, NetworkHost};
pub use hyperv::PowerShellHost;
pub use plan::{NetworkContext, ResourceNames};
pub use reconcile::{Reconciler, ReconcilerSettings, RunOutcome};
