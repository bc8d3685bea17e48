//! Clean-slate reconciliation: tear everything down, then build it again

mod provision;
mod teardown;

pub use provision::ProvisionState;
pub use teardown::{teardown, ResourceKind, StepOutcome, TeardownReport, TeardownStep};

use crate::config::{Action, ReconciliationConfig};
use crate::host::{IpAssignment, NetworkHost, StaticMapping};
use crate::plan::{NetworkContext, ResourceNames};
use crate::{Error, Result};
use provision::Provisioner;
use serde::Serialize;
use std::time::Duration;

/// Seconds to wait after switch creation before the adapter is addressed
pub const DEFAULT_ADAPTER_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Fixed wait for Windows to register the switch's host vNIC
    pub adapter_registration_delay: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            adapter_registration_delay: Duration::from_secs(DEFAULT_ADAPTER_DELAY_SECS),
        }
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub teardown: TeardownReport,
    pub mappings_applied: usize,
    pub state: ProvisionState,
}

#[derive(Debug, Clone, Serialize)]
pub enum RunOutcome {
    Applied(ApplyReport),
    Removed(TeardownReport),
}

/// What the host currently has for a network
#[derive(Debug, Clone, Serialize)]
pub struct HostInventory {
    pub names: ResourceNames,
    pub switch: bool,
    pub ip_assignments: Vec<IpAssignment>,
    pub nat: bool,
    pub static_mappings: Vec<StaticMapping>,
}

impl HostInventory {
    /// Nothing belonging to the network exists
    pub fn is_empty(&self) -> bool {
        !self.switch && !self.nat && self.ip_assignments.is_empty() && self.static_mappings.is_empty()
    }
}

pub struct Reconciler<H> {
    host: H,
    settings: ReconcilerSettings,
}

impl<H: NetworkHost> Reconciler<H> {
    pub fn new(host: H) -> Self {
        Self::with_settings(host, ReconcilerSettings::default())
    }

    pub fn with_settings(host: H, settings: ReconcilerSettings) -> Self {
        Self { host, settings }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Dispatch on the config's action, or the override when given
    pub fn run(&self, config: &ReconciliationConfig, action: Option<Action>) -> Result<RunOutcome> {
        let action = action.unwrap_or(config.action);
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "reconcile",
            run = %run_id,
            network = %config.network.name,
            %action
        );
        let _enter = span.enter();

        match action {
            Action::Apply => self.apply(config).map(RunOutcome::Applied),
            Action::Remove => Ok(RunOutcome::Removed(self.remove(&config.context()))),
        }
    }

    /// Tear down whatever exists, then provision from scratch.
    ///
    /// Provisioning failures trigger another teardown as rollback. The original
    /// error is returned either way, with remediation steps attached when the
    /// rollback itself left something behind.
    pub fn apply(&self, config: &ReconciliationConfig) -> Result<ApplyReport> {
        let ctx = config.context();

        tracing::info!(
            switch = %ctx.names.switch,
            nat = %ctx.names.nat,
            subnet = %ctx.subnet,
            gateway = %ctx.gateway,
            "Removing existing resources"
        );
        let before = teardown(&self.host, &ctx);

        tracing::info!(rules = config.port_forwarding.len(), "Provisioning");
        let mut provisioner =
            Provisioner::new(&self.host, &ctx, self.settings.adapter_registration_delay);

        match provisioner.run(&config.port_forwarding) {
            Ok(()) => Ok(ApplyReport {
                teardown: before,
                mappings_applied: config.port_forwarding.len(),
                state: provisioner.state(),
            }),
            Err(e) => {
                let state = provisioner.state();
                tracing::error!(error = %e, %state, "Provisioning failed, rolling back");
                Err(self.rollback(&ctx, state, e))
            }
        }
    }

    /// Remove every resource of the network. Never fails; problems are in the report.
    pub fn remove(&self, ctx: &NetworkContext) -> TeardownReport {
        tracing::info!(switch = %ctx.names.switch, nat = %ctx.names.nat, "Removing network");
        let report = teardown(&self.host, ctx);
        tracing::info!(removed = report.removed_count(), clean = report.is_clean(), "Removal finished");
        report
    }

    /// Read current host state without changing anything
    pub fn inspect(&self, ctx: &NetworkContext) -> Result<HostInventory> {
        let names = ctx.names.clone();
        Ok(HostInventory {
            switch: self.host.switch_exists(&names.switch)?,
            ip_assignments: self.host.find_ip_assignments(ctx.gateway)?,
            nat: self.host.nat_exists(&names.nat)?,
            static_mappings: self.host.list_static_mappings(&names.nat)?,
            names,
        })
    }

    fn rollback(&self, ctx: &NetworkContext, state: ProvisionState, cause: Error) -> Error {
        let report = teardown(&self.host, ctx);

        let remediation = if report.is_clean() {
            tracing::info!(removed = report.removed_count(), "Rollback complete");
            Vec::new()
        } else {
            for (kind, message) in report.failures() {
                tracing::error!(resource = %kind, error = message, "Rollback could not remove resource");
            }
            ctx.remediation_steps()
        };

        Error::Provisioning {
            state: state.to_string(),
            source: Box::new(cause),
            remediation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockNetworkHost;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const CONFIG: &str = r#"{
        "network": { "name": "lab", "subnet": "192.168.100.0/24" },
        "portForwarding": [
            { "name": "rdp", "protocol": "TCP", "externalPort": 50001,
              "internalIP": "192.168.100.10", "internalPort": 3389 }
        ]
    }"#;

    fn settings() -> ReconcilerSettings {
        ReconcilerSettings {
            adapter_registration_delay: Duration::ZERO,
        }
    }

    /// Switch and IP creation succeed, NAT creation fails
    fn failing_nat_host(rollback_fails: bool) -> MockNetworkHost {
        let switch = Arc::new(AtomicBool::new(false));
        let ip = Arc::new(AtomicBool::new(false));
        let mut host = MockNetworkHost::new();

        host.expect_list_static_mappings().returning(|_| Ok(vec![]));
        host.expect_nat_exists().returning(|_| Ok(false));
        host.expect_remove_nat().never();
        host.expect_add_static_mapping().never();

        let s = switch.clone();
        host.expect_switch_exists().returning(move |_| Ok(s.load(Ordering::SeqCst)));
        let s = switch.clone();
        host.expect_create_switch().times(1).returning(move |_| {
            s.store(true, Ordering::SeqCst);
            Ok(())
        });
        let s = switch.clone();
        host.expect_remove_switch()
            .withf(|name| name == "lab")
            .times(1)
            .returning(move |_| {
                if rollback_fails {
                    return Err(Error::host("Remove-VMSwitch", "switch in use"));
                }
                s.store(false, Ordering::SeqCst);
                Ok(())
            });

        let i = ip.clone();
        host.expect_find_ip_assignments().returning(move |addr| {
            if i.load(Ordering::SeqCst) {
                Ok(vec![IpAssignment {
                    ip_address: addr,
                    interface_alias: "vEthernet (lab)".into(),
                    interface_index: 9,
                    prefix_length: 24,
                }])
            } else {
                Ok(vec![])
            }
        });
        let i = ip.clone();
        host.expect_assign_ip().times(1).returning(move |_, _, _| {
            i.store(true, Ordering::SeqCst);
            Ok(())
        });
        let i = ip.clone();
        host.expect_remove_ip()
            .withf(|a| a.ip_address == Ipv4Addr::new(192, 168, 100, 1))
            .times(1)
            .returning(move |_| {
                i.store(false, Ordering::SeqCst);
                Ok(())
            });

        host.expect_create_nat()
            .times(1)
            .returning(|_, _| Err(Error::host("New-NetNat", "prefix overlaps an existing NAT")));

        host
    }

    #[test]
    fn test_nat_failure_rolls_back_switch_and_ip() {
        let config = ReconciliationConfig::from_json(CONFIG).unwrap();
        let reconciler = Reconciler::with_settings(failing_nat_host(false), settings());

        let err = reconciler.apply(&config).unwrap_err();
        match &err {
            Error::Provisioning { state, source, remediation } => {
                assert_eq!(state, "IPAssigned");
                assert!(matches!(**source, Error::HostOperation { .. }));
                assert!(remediation.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_failed_rollback_reports_remediation() {
        let config = ReconciliationConfig::from_json(CONFIG).unwrap();
        let reconciler = Reconciler::with_settings(failing_nat_host(true), settings());

        let err = reconciler.apply(&config).unwrap_err();
        let steps = err.remediation();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().any(|s| s.contains("Remove-VMSwitch -Name 'lab'")));
    }

    #[test]
    fn test_action_override() {
        let config = ReconciliationConfig::from_json(CONFIG).unwrap();
        let mut host = MockNetworkHost::new();
        host.expect_list_static_mappings().returning(|_| Ok(vec![]));
        host.expect_nat_exists().returning(|_| Ok(false));
        host.expect_find_ip_assignments().returning(|_| Ok(vec![]));
        host.expect_switch_exists().returning(|_| Ok(false));
        host.expect_create_switch().never();

        let reconciler = Reconciler::with_settings(host, settings());
        match reconciler.run(&config, Some(Action::Remove)).unwrap() {
            RunOutcome::Removed(report) => assert_eq!(report.removed_count(), 0),
            RunOutcome::Applied(_) => panic!("override ignored"),
        }
    }
}
