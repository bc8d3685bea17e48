//! Resource naming and the per-run network context

use crate::hyperv::escape_ps;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Host resource names derived from the network name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    /// Internal Hyper-V virtual switch
    pub switch: String,
    /// NetNat instance
    pub nat: String,
    /// Interface alias Windows gives the switch's host vNIC
    pub adapter: String,
}

impl ResourceNames {
    pub fn derive(network_name: &str) -> Self {
        let switch = network_name.to_string();
        Self {
            nat: format!("{}-nat", network_name),
            adapter: format!("vEthernet ({})", switch),
            switch,
        }
    }
}

/// Everything teardown and provisioning need to know about the network.
/// Built once per run from the validated config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub names: ResourceNames,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
}

impl NetworkContext {
    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix()
    }

    /// Commands an operator can run when automatic cleanup left something behind
    pub fn remediation_steps(&self) -> Vec<String> {
        let nat = escape_ps(&self.names.nat);
        let switch = escape_ps(&self.names.switch);
        vec![
            format!(
                "Get-NetNatStaticMapping -NatName '{}' | Remove-NetNatStaticMapping -Confirm:$false",
                nat
            ),
            format!("Remove-NetNat -Name '{}' -Confirm:$false", nat),
            format!(
                "Remove-NetIPAddress -IPAddress {} -Confirm:$false",
                self.gateway
            ),
            format!("Remove-VMSwitch -Name '{}' -Force", switch),
        ]
    }
}
