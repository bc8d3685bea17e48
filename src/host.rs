//! Host networking collaborator
//!
//! The reconciler only talks to the OS through [`NetworkHost`]. Each resource
//! kind gets a query, a create and a delete; nothing here knows about ordering
//! or rollback.

use crate::config::{PortForwardingRule, Protocol};
use crate::Result;
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// An IPv4 address bound to a host interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpAssignment {
    #[serde(rename = "IPAddress")]
    pub ip_address: Ipv4Addr,
    pub interface_alias: String,
    pub interface_index: u32,
    pub prefix_length: u8,
}

/// A static mapping as reported by the host NAT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticMapping {
    #[serde(rename = "StaticMappingID")]
    pub id: u32,
    pub protocol: Protocol,
    pub external_port: u16,
    #[serde(rename = "InternalIPAddress")]
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
}

/// Create/query/delete operations per resource kind
#[cfg_attr(test, mockall::automock)]
pub trait NetworkHost {
    fn switch_exists(&self, name: &str) -> Result<bool>;
    fn create_switch(&self, name: &str) -> Result<()>;
    fn remove_switch(&self, name: &str) -> Result<()>;

    /// Every interface currently carrying `ip`
    fn find_ip_assignments(&self, ip: Ipv4Addr) -> Result<Vec<IpAssignment>>;
    fn assign_ip(&self, interface_alias: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()>;
    fn remove_ip(&self, assignment: &IpAssignment) -> Result<()>;

    fn nat_exists(&self, name: &str) -> Result<bool>;
    fn create_nat(&self, name: &str, internal_prefix: Ipv4Network) -> Result<()>;
    fn remove_nat(&self, name: &str) -> Result<()>;

    fn list_static_mappings(&self, nat_name: &str) -> Result<Vec<StaticMapping>>;
    fn add_static_mapping(&self, nat_name: &str, rule: &PortForwardingRule) -> Result<()>;
    fn remove_static_mapping(&self, nat_name: &str, mapping_id: u32) -> Result<()>;
}

impl<H: NetworkHost + ?Sized> NetworkHost for &H {
    fn switch_exists(&self, name: &str) -> Result<bool> {
        (**self).switch_exists(name)
    }
    fn create_switch(&self, name: &str) -> Result<()> {
        (**self).create_switch(name)
    }
    fn remove_switch(&self, name: &str) -> Result<()> {
        (**self).remove_switch(name)
    }
    fn find_ip_assignments(&self, ip: Ipv4Addr) -> Result<Vec<IpAssignment>> {
        (**self).find_ip_assignments(ip)
    }
    fn assign_ip(&self, interface_alias: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
        (**self).assign_ip(interface_alias, ip, prefix_len)
    }
    fn remove_ip(&self, assignment: &IpAssignment) -> Result<()> {
        (**self).remove_ip(assignment)
    }
    fn nat_exists(&self, name: &str) -> Result<bool> {
        (**self).nat_exists(name)
    }
    fn create_nat(&self, name: &str, internal_prefix: Ipv4Network) -> Result<()> {
        (**self).create_nat(name, internal_prefix)
    }
    fn remove_nat(&self, name: &str) -> Result<()> {
        (**self).remove_nat(name)
    }
    fn list_static_mappings(&self, nat_name: &str) -> Result<Vec<StaticMapping>> {
        (**self).list_static_mappings(nat_name)
    }
    fn add_static_mapping(&self, nat_name: &str, rule: &PortForwardingRule) -> Result<()> {
        (**self).add_static_mapping(nat_name, rule)
    }
    fn remove_static_mapping(&self, nat_name: &str, mapping_id: u32) -> Result<()> {
        (**self).remove_static_mapping(nat_name, mapping_id)
    }
}

/// A mutation the dry-run host would have issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOperation {
    CreateSwitch(String),
    RemoveSwitch(String),
    AssignIp { interface_alias: String, ip: Ipv4Addr, prefix_len: u8 },
    RemoveIp { interface_alias: String, ip: Ipv4Addr },
    CreateNat { name: String, internal_prefix: Ipv4Network },
    RemoveNat(String),
    AddStaticMapping { nat_name: String, rule: PortForwardingRule },
    RemoveStaticMapping { nat_name: String, mapping_id: u32 },
}

impl std::fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannedOperation::CreateSwitch(name) => write!(f, "create switch '{}'", name),
            PlannedOperation::RemoveSwitch(name) => write!(f, "remove switch '{}'", name),
            PlannedOperation::AssignIp { interface_alias, ip, prefix_len } => {
                write!(f, "assign {}/{} to '{}'", ip, prefix_len, interface_alias)
            }
            PlannedOperation::RemoveIp { interface_alias, ip } => {
                write!(f, "remove {} from '{}'", ip, interface_alias)
            }
            PlannedOperation::CreateNat { name, internal_prefix } => {
                write!(f, "create NAT '{}' for {}", name, internal_prefix)
            }
            PlannedOperation::RemoveNat(name) => write!(f, "remove NAT '{}'", name),
            PlannedOperation::AddStaticMapping { nat_name, rule } => write!(
                f,
                "map {} {} -> {}:{} on '{}'",
                rule.protocol, rule.external_port, rule.internal_ip, rule.internal_port, nat_name
            ),
            PlannedOperation::RemoveStaticMapping { nat_name, mapping_id } => {
                write!(f, "remove mapping #{} from '{}'", mapping_id, nat_name)
            }
        }
    }
}

/// Passes queries through to a real host and records mutations instead of running them
pub struct DryRunHost<H> {
    inner: H,
    planned: Mutex<Vec<PlannedOperation>>,
}

impl<H: NetworkHost> DryRunHost<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Mutations recorded so far, in issue order
    pub fn planned(&self) -> Vec<PlannedOperation> {
        self.planned.lock().clone()
    }

    fn record(&self, op: PlannedOperation) -> Result<()> {
        tracing::info!(operation = %op, "Dry run: skipped");
        self.planned.lock().push(op);
        Ok(())
    }
}

impl<H: NetworkHost> NetworkHost for DryRunHost<H> {
    fn switch_exists(&self, name: &str) -> Result<bool> {
        self.inner.switch_exists(name)
    }

    fn create_switch(&self, name: &str) -> Result<()> {
        self.record(PlannedOperation::CreateSwitch(name.to_string()))
    }

    fn remove_switch(&self, name: &str) -> Result<()> {
        self.record(PlannedOperation::RemoveSwitch(name.to_string()))
    }

    fn find_ip_assignments(&self, ip: Ipv4Addr) -> Result<Vec<IpAssignment>> {
        self.inner.find_ip_assignments(ip)
    }

    fn assign_ip(&self, interface_alias: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.record(PlannedOperation::AssignIp {
            interface_alias: interface_alias.to_string(),
            ip,
            prefix_len,
        })
    }

    fn remove_ip(&self, assignment: &IpAssignment) -> Result<()> {
        self.record(PlannedOperation::RemoveIp {
            interface_alias: assignment.interface_alias.clone(),
            ip: assignment.ip_address,
        })
    }

    fn nat_exists(&self, name: &str) -> Result<bool> {
        self.inner.nat_exists(name)
    }

    fn create_nat(&self, name: &str, internal_prefix: Ipv4Network) -> Result<()> {
        self.record(PlannedOperation::CreateNat {
            name: name.to_string(),
            internal_prefix,
        })
    }

    fn remove_nat(&self, name: &str) -> Result<()> {
        self.record(PlannedOperation::RemoveNat(name.to_string()))
    }

    fn list_static_mappings(&self, nat_name: &str) -> Result<Vec<StaticMapping>> {
        self.inner.list_static_mappings(nat_name)
    }

    fn add_static_mapping(&self, nat_name: &str, rule: &PortForwardingRule) -> Result<()> {
        self.record(PlannedOperation::AddStaticMapping {
            nat_name: nat_name.to_string(),
            rule: rule.clone(),
        })
    }

    fn remove_static_mapping(&self, nat_name: &str, mapping_id: u32) -> Result<()> {
        self.record(PlannedOperation::RemoveStaticMapping {
            nat_name: nat_name.to_string(),
            mapping_id,
        })
    }
}
