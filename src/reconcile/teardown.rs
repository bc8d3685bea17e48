//! Best-effort removal of every resource belonging to a network

use crate::host::NetworkHost;
use crate::plan::NetworkContext;
use crate::Result;
use serde::Serialize;
use std::fmt;

/// Resource classes in teardown order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceKind {
    PortMappings,
    Nat,
    IpAddress,
    Switch,
}

impl ResourceKind {
    pub const TEARDOWN_ORDER: [ResourceKind; 4] = [
        ResourceKind::PortMappings,
        ResourceKind::Nat,
        ResourceKind::IpAddress,
        ResourceKind::Switch,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::PortMappings => write!(f, "port mappings"),
            ResourceKind::Nat => write!(f, "NAT"),
            ResourceKind::IpAddress => write!(f, "IP address"),
            ResourceKind::Switch => write!(f, "virtual switch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    /// Nothing matched
    Absent,
    /// This many objects were deleted
    Removed(usize),
    /// The class could not be fully cleaned up; `removed` objects still went
    Failed { removed: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownStep {
    pub kind: ResourceKind,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    /// Total objects deleted across all classes
    pub fn removed_count(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s.outcome {
                StepOutcome::Removed(n) | StepOutcome::Failed { removed: n, .. } => n,
                StepOutcome::Absent => 0,
            })
            .sum()
    }

    /// True when no class reported a failure
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = (ResourceKind, &str)> {
        self.steps.iter().filter_map(|s| match &s.outcome {
            StepOutcome::Failed { message, .. } => Some((s.kind, message.as_str())),
            _ => None,
        })
    }
}

/// Per-class tally. Every matched object is attempted even after one fails.
#[derive(Default)]
struct ClassResult {
    removed: usize,
    errors: Vec<String>,
}

impl ClassResult {
    fn record(&mut self, kind: ResourceKind, object: &str, result: Result<()>) {
        match result {
            Ok(()) => self.removed += 1,
            Err(e) => {
                tracing::warn!(resource = %kind, object, error = %e, "Could not remove, continuing");
                self.errors.push(format!("{}: {}", object, e));
            }
        }
    }

    fn into_outcome(self) -> StepOutcome {
        if !self.errors.is_empty() {
            StepOutcome::Failed {
                removed: self.removed,
                message: self.errors.join("; "),
            }
        } else if self.removed == 0 {
            StepOutcome::Absent
        } else {
            StepOutcome::Removed(self.removed)
        }
    }
}

/// Remove mappings, NAT, gateway IP and switch, in that order.
///
/// A failure in one class, or on one object within a class, is logged and
/// recorded; everything else is still attempted.
pub fn teardown<H: NetworkHost + ?Sized>(host: &H, ctx: &NetworkContext) -> TeardownReport {
    let mut report = TeardownReport::default();

    for kind in ResourceKind::TEARDOWN_ORDER {
        let outcome = match remove_kind(host, ctx, kind) {
            Ok(class) => class.into_outcome(),
            Err(e) => {
                tracing::warn!(resource = %kind, error = %e, "Query failed, skipping");
                StepOutcome::Failed {
                    removed: 0,
                    message: e.to_string(),
                }
            }
        };
        match &outcome {
            StepOutcome::Absent => tracing::info!(resource = %kind, "Not present, nothing to remove"),
            StepOutcome::Removed(n) => tracing::info!(resource = %kind, count = n, "Removed"),
            StepOutcome::Failed { removed, .. } => {
                tracing::warn!(resource = %kind, removed, "Teardown step incomplete, continuing")
            }
        }
        report.steps.push(TeardownStep { kind, outcome });
    }

    report
}

/// Only the existence query can fail the whole class
fn remove_kind<H: NetworkHost + ?Sized>(
    host: &H,
    ctx: &NetworkContext,
    kind: ResourceKind,
) -> Result<ClassResult> {
    let names = &ctx.names;
    let mut class = ClassResult::default();

    match kind {
        ResourceKind::PortMappings => {
            for m in host.list_static_mappings(&names.nat)? {
                tracing::debug!(
                    nat = %names.nat,
                    id = m.id,
                    protocol = %m.protocol,
                    external_port = m.external_port,
                    "Removing static mapping"
                );
                let result = host.remove_static_mapping(&names.nat, m.id);
                class.record(kind, &format!("mapping #{}", m.id), result);
            }
        }
        ResourceKind::Nat => {
            if host.nat_exists(&names.nat)? {
                class.record(kind, &names.nat, host.remove_nat(&names.nat));
            }
        }
        ResourceKind::IpAddress => {
            for a in host.find_ip_assignments(ctx.gateway)? {
                if a.interface_alias != names.adapter {
                    tracing::warn!(
                        ip = %a.ip_address,
                        interface = %a.interface_alias,
                        "Gateway address is bound to a foreign interface, removing it"
                    );
                }
                let result = host.remove_ip(&a);
                class.record(kind, &format!("{} on {}", a.ip_address, a.interface_alias), result);
            }
        }
        ResourceKind::Switch => {
            if host.switch_exists(&names.switch)? {
                class.record(kind, &names.switch, host.remove_switch(&names.switch));
            }
        }
    }

    Ok(class)
}
