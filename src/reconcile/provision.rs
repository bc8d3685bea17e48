//! Ordered creation of switch, gateway IP, NAT and static mappings

use crate::config::PortForwardingRule;
use crate::host::NetworkHost;
use crate::plan::NetworkContext;
use crate::Result;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// How far provisioning got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProvisionState {
    Absent,
    SwitchCreated,
    IpAssigned,
    NatCreated,
    /// Number of static mappings added so far
    MappingsApplied(usize),
    Ready,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::Absent => write!(f, "Absent"),
            ProvisionState::SwitchCreated => write!(f, "SwitchCreated"),
            ProvisionState::IpAssigned => write!(f, "IPAssigned"),
            ProvisionState::NatCreated => write!(f, "NatCreated"),
            ProvisionState::MappingsApplied(n) => write!(f, "MappingsApplied({})", n),
            ProvisionState::Ready => write!(f, "Ready"),
        }
    }
}

/// Tracks progress so a failure can report where it stopped
pub(crate) struct Provisioner<'a, H: ?Sized> {
    host: &'a H,
    ctx: &'a NetworkContext,
    adapter_delay: Duration,
    state: ProvisionState,
}

impl<'a, H: NetworkHost + ?Sized> Provisioner<'a, H> {
    pub(crate) fn new(host: &'a H, ctx: &'a NetworkContext, adapter_delay: Duration) -> Self {
        Self {
            host,
            ctx,
            adapter_delay,
            state: ProvisionState::Absent,
        }
    }

    pub(crate) fn state(&self) -> ProvisionState {
        self.state
    }

    fn advance(&mut self, next: ProvisionState) {
        tracing::debug!(from = %self.state, to = %next, "Provisioning state");
        self.state = next;
    }

    /// Run every creation step; stops at the first error
    pub(crate) fn run(&mut self, rules: &[PortForwardingRule]) -> Result<()> {
        let (host, ctx) = (self.host, self.ctx);
        let names = &ctx.names;

        host.create_switch(&names.switch)?;
        tracing::info!(switch = %names.switch, "Virtual switch created");
        self.advance(ProvisionState::SwitchCreated);

        if !self.adapter_delay.is_zero() {
            tracing::info!(
                adapter = %names.adapter,
                seconds = self.adapter_delay.as_secs_f32(),
                "Waiting for adapter registration"
            );
            std::thread::sleep(self.adapter_delay);
        }

        host.assign_ip(&names.adapter, ctx.gateway, ctx.prefix_len())?;
        tracing::info!(
            adapter = %names.adapter,
            gateway = %ctx.gateway,
            prefix = ctx.prefix_len(),
            "Gateway IP assigned"
        );
        self.advance(ProvisionState::IpAssigned);

        host.create_nat(&names.nat, ctx.subnet)?;
        tracing::info!(nat = %names.nat, subnet = %ctx.subnet, "NAT created");
        self.advance(ProvisionState::NatCreated);

        for (i, rule) in rules.iter().enumerate() {
            host.add_static_mapping(&names.nat, rule)?;
            tracing::info!(
                rule = %rule.name,
                protocol = %rule.protocol,
                external_port = rule.external_port,
                internal_ip = %rule.internal_ip,
                internal_port = rule.internal_port,
                "Port mapping added"
            );
            self.advance(ProvisionState::MappingsApplied(i + 1));
        }

        self.advance(ProvisionState::Ready);
        Ok(())
    }
}
