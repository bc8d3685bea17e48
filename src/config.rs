//! Network document loading and validation

use crate::plan::{NetworkContext, ResourceNames};
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

/// What a run does with the declared network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Tear down, then recreate everything
    #[default]
    Apply,
    /// Tear down only
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Apply => write!(f, "apply"),
            Action::Remove => write!(f, "remove"),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply" => Ok(Action::Apply),
            "remove" => Ok(Action::Remove),
            other => Err(Error::validation(
                "action",
                format!("'{}' is not one of: apply, remove", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// The network to declare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: Ipv4Network,
    /// Explicit gateway, or the first host address of the subnet
    pub gateway: Ipv4Addr,
}

/// A static NAT mapping from an external port to an internal address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardingRule {
    pub name: String,
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
}

/// Settings a VM should be given by hand. Never provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHint {
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub memo: Option<String>,
}

/// A validated network document
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub action: Action,
    pub network: NetworkSpec,
    pub port_forwarding: Vec<PortForwardingRule>,
    pub vms: Vec<VmHint>,
}

// Wire shapes. Scalars are kept loose so that validation reports bad values
// against a field path; only malformed JSON or a wrongly-shaped section is a
// parse error.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    action: Option<String>,
    network: Option<NetworkDocument>,
    #[serde(default)]
    port_forwarding: Vec<RuleDocument>,
    #[serde(default)]
    vms: Vec<VmHint>,
}

#[derive(Debug, Deserialize)]
struct NetworkDocument {
    name: Option<String>,
    subnet: Option<String>,
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDocument {
    name: Option<String>,
    protocol: Option<String>,
    external_port: Option<Value>,
    #[serde(rename = "internalIP")]
    internal_ip: Option<String>,
    internal_port: Option<Value>,
}

impl ReconciliationConfig {
    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_action(path, None)
    }

    /// Like [`load`](Self::load), but an explicit action replaces the file's
    /// `action` field, which is then not validated at all
    pub fn load_with_action(path: impl AsRef<Path>, action: Option<Action>) -> Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ConfigNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), bytes = text.len(), "Loaded config");
        Self::from_json_with_action(&text, action)
    }

    /// Parse and validate a config document
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_json_with_action(text, None)
    }

    pub fn from_json_with_action(text: &str, action: Option<Action>) -> Result<Self> {
        let doc: ConfigDocument =
            serde_json::from_str(text).map_err(|e| Error::ConfigParse(e.to_string()))?;
        doc.validate(action)
    }

    /// Non-fatal problems worth showing the operator: VM hints and rule
    /// targets that fall outside the subnet
    pub fn advisories(&self) -> Vec<String> {
        let subnet = self.network.subnet;
        let mut notes = Vec::new();

        for rule in &self.port_forwarding {
            if !subnet.contains(rule.internal_ip) {
                notes.push(format!(
                    "rule '{}' forwards to {} which is outside {}",
                    rule.name, rule.internal_ip, subnet
                ));
            }
        }

        for vm in &self.vms {
            if vm.ip.trim().is_empty() {
                notes.push(format!("VM '{}' has no address", vm.name));
                continue;
            }
            match vm.ip.parse::<Ipv4Addr>() {
                Ok(ip) if ip == self.network.gateway => notes.push(format!(
                    "VM '{}' uses the gateway address {}",
                    vm.name, ip
                )),
                Ok(ip) if !subnet.contains(ip) => notes.push(format!(
                    "VM '{}' address {} is outside {}",
                    vm.name, ip, subnet
                )),
                Ok(_) => {}
                Err(_) => notes.push(format!(
                    "VM '{}' address '{}' is not an IPv4 address",
                    vm.name, vm.ip
                )),
            }
        }

        notes
    }

    /// Immutable naming/addressing context shared by teardown and provisioning
    pub fn context(&self) -> NetworkContext {
        NetworkContext {
            names: ResourceNames::derive(&self.network.name),
            subnet: self.network.subnet,
            gateway: self.network.gateway,
        }
    }
}

impl ConfigDocument {
    fn validate(self, action_override: Option<Action>) -> Result<ReconciliationConfig> {
        let action = match (action_override, self.action.as_deref()) {
            (Some(action), _) => action,
            (None, Some(s)) => s.parse()?,
            (None, None) => Action::default(),
        };

        let network = self
            .network
            .ok_or_else(|| Error::validation("network", "section is required"))?
            .validate()?;

        let mut port_forwarding = Vec::with_capacity(self.port_forwarding.len());
        let mut seen = HashSet::new();
        for (i, raw) in self.port_forwarding.into_iter().enumerate() {
            let rule = raw.validate(i)?;
            if !seen.insert((rule.protocol, rule.external_port)) {
                return Err(Error::validation(
                    format!("portForwarding[{}].externalPort", i),
                    format!(
                        "{} port {} is already forwarded by an earlier rule",
                        rule.protocol, rule.external_port
                    ),
                ));
            }
            port_forwarding.push(rule);
        }

        Ok(ReconciliationConfig {
            action,
            network,
            port_forwarding,
            vms: self.vms,
        })
    }
}

impl NetworkDocument {
    fn validate(self) -> Result<NetworkSpec> {
        let name = required(self.name, "network.name")?;
        let subnet_str = required(self.subnet, "network.subnet")?;
        let subnet = parse_subnet(&subnet_str)?;

        let gateway = match self.gateway.as_deref().map(str::trim) {
            None | Some("") => default_gateway(&subnet),
            Some(s) => {
                let ip: Ipv4Addr = s.parse().map_err(|_| {
                    Error::validation("network.gateway", format!("'{}' is not an IPv4 address", s))
                })?;
                if !subnet.contains(ip) || ip == subnet.network() || ip == subnet.broadcast() {
                    return Err(Error::validation(
                        "network.gateway",
                        format!("{} is not a host address in {}", ip, subnet),
                    ));
                }
                ip
            }
        };

        Ok(NetworkSpec {
            name,
            subnet,
            gateway,
        })
    }
}

impl RuleDocument {
    fn validate(self, index: usize) -> Result<PortForwardingRule> {
        let field = |f: &str| format!("portForwarding[{}].{}", index, f);

        let name = required(self.name, &field("name"))?;
        let protocol_str = required(self.protocol, &field("protocol"))?;
        let protocol = Protocol::parse(&protocol_str).ok_or_else(|| {
            Error::validation(
                field("protocol"),
                format!("'{}' is not one of: TCP, UDP", protocol_str),
            )
        })?;
        let external_port = parse_port(self.external_port, &field("externalPort"))?;
        let ip_str = required(self.internal_ip, &field("internalIP"))?;
        let internal_ip: Ipv4Addr = ip_str.parse().map_err(|_| {
            Error::validation(field("internalIP"), format!("'{}' is not an IPv4 address", ip_str))
        })?;
        let internal_port = parse_port(self.internal_port, &field("internalPort"))?;

        Ok(PortForwardingRule {
            name,
            protocol,
            external_port,
            internal_ip,
            internal_port,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(Error::validation(field, "is required")),
    }
}

fn parse_port(value: Option<Value>, field: &str) -> Result<u16> {
    let value = value.ok_or_else(|| Error::validation(field, "is required"))?;
    let port = match &value {
        Value::Number(n) if !n.is_f64() => n,
        other => {
            return Err(Error::validation(
                field,
                format!("{} is not an integer port number", other),
            ))
        }
    };
    match port.as_u64().and_then(|p| u16::try_from(p).ok()) {
        Some(p) if p >= 1 => Ok(p),
        _ => Err(Error::validation(
            field,
            format!("{} is outside the range 1-65535", port),
        )),
    }
}

/// Parse a strict `A.B.C.D/N` subnet, normalised to its network address
pub fn parse_subnet(s: &str) -> Result<Ipv4Network> {
    let invalid = || {
        Error::validation(
            "network.subnet",
            format!("'{}' is not a CIDR of the form A.B.C.D/N", s),
        )
    };

    // ipnetwork accepts shorthand like "10/8", so split and check each half ourselves
    let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 30 {
        return Err(Error::validation(
            "network.subnet",
            format!("/{} leaves no room for a gateway and hosts (max /30)", prefix),
        ));
    }

    let net = Ipv4Network::new(addr, prefix).map_err(|_| invalid())?;
    Ipv4Network::new(net.network(), prefix).map_err(|_| invalid())
}

/// The `.1` host address of a subnet
pub fn default_gateway(subnet: &Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "action": "apply",
        "network": { "name": "DevNAT", "subnet": "192.168.100.0/24" },
        "portForwarding": [
            { "name": "rdp", "protocol": "TCP", "externalPort": 50001,
              "internalIP": "192.168.100.10", "internalPort": 3389 },
            { "name": "dns", "protocol": "udp", "externalPort": 5353,
              "internalIP": "192.168.100.11", "internalPort": 53 }
        ],
        "vms": [
            { "name": "build-01", "ip": "192.168.100.10", "memo": "CI runner" },
            { "name": "test-01", "ip": "192.168.100.11" }
        ]
    }"#;

    fn with_network(subnet: &str) -> String {
        format!(r#"{{ "network": {{ "name": "lab", "subnet": "{}" }} }}"#, subnet)
    }

    fn with_rule(external_port: i64) -> String {
        format!(
            r#"{{
                "network": {{ "name": "lab", "subnet": "10.0.0.0/24" }},
                "portForwarding": [{{ "name": "web", "protocol": "TCP",
                    "externalPort": {}, "internalIP": "10.0.0.5", "internalPort": 80 }}]
            }}"#,
            external_port
        )
    }

    fn field_of(err: Error) -> String {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sample() {
        let config = ReconciliationConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.action, Action::Apply);
        assert_eq!(config.network.name, "DevNAT");
        assert_eq!(config.network.subnet.prefix(), 24);
        assert_eq!(config.port_forwarding.len(), 2);
        assert_eq!(config.port_forwarding[1].protocol, Protocol::Udp);
        assert_eq!(config.port_forwarding[0].internal_port, 3389);
        assert_eq!(config.vms[0].memo.as_deref(), Some("CI runner"));
        assert_eq!(config.vms[1].memo, None);
    }

    #[test]
    fn test_default_gateway() {
        let config = ReconciliationConfig::from_json(&with_network("192.168.100.0/24")).unwrap();
        assert_eq!(config.network.gateway, Ipv4Addr::new(192, 168, 100, 1));
    }

    #[test]
    fn test_explicit_gateway() {
        let json = r#"{ "network": { "name": "lab", "subnet": "10.1.0.0/16", "gateway": "10.1.0.254" } }"#;
        let config = ReconciliationConfig::from_json(json).unwrap();
        assert_eq!(config.network.gateway, Ipv4Addr::new(10, 1, 0, 254));

        let json = r#"{ "network": { "name": "lab", "subnet": "10.1.0.0/16", "gateway": "10.2.0.1" } }"#;
        let err = ReconciliationConfig::from_json(json).unwrap_err();
        assert_eq!(field_of(err), "network.gateway");
    }

    #[test]
    fn test_subnet_shape() {
        for bad in [
            "192.168.100.0",
            "192.168.100/24",
            "192.168.100.0/",
            "192.168.100.0/abc",
            "192.168.100.0/+8",
            "192.168.1000.0/24",
            "fd00::/64",
            "lab",
        ] {
            let err = ReconciliationConfig::from_json(&with_network(bad)).unwrap_err();
            assert_eq!(field_of(err), "network.subnet", "accepted {bad}");
        }
    }

    #[test]
    fn test_subnet_prefix_bounds() {
        assert!(parse_subnet("10.0.0.0/31").is_err());
        assert!(parse_subnet("10.0.0.0/33").is_err());
        assert!(parse_subnet("10.0.0.0/30").is_ok());
    }

    #[test]
    fn test_subnet_normalised() {
        let subnet = parse_subnet("172.20.5.77/16").unwrap();
        assert_eq!(subnet.to_string(), "172.20.0.0/16");
        assert_eq!(default_gateway(&subnet), Ipv4Addr::new(172, 20, 0, 1));
    }

    #[test]
    fn test_port_range() {
        for bad in [0, 65536, -1] {
            let err = ReconciliationConfig::from_json(&with_rule(bad)).unwrap_err();
            assert_eq!(field_of(err), "portForwarding[0].externalPort");
        }
        assert!(ReconciliationConfig::from_json(&with_rule(1)).is_ok());
        assert!(ReconciliationConfig::from_json(&with_rule(65535)).is_ok());
    }

    #[test]
    fn test_port_must_be_integer() {
        for bad in [r#""8080""#, "80.5", "true", "[80]"] {
            let json = format!(
                r#"{{
                    "network": {{ "name": "lab", "subnet": "10.0.0.0/24" }},
                    "portForwarding": [{{ "name": "web", "protocol": "TCP",
                        "externalPort": {}, "internalIP": "10.0.0.5", "internalPort": 80 }}]
                }}"#,
                bad
            );
            let err = ReconciliationConfig::from_json(&json).unwrap_err();
            assert_eq!(field_of(err), "portForwarding[0].externalPort", "accepted {bad}");
        }

        let json = r#"{
            "network": { "name": "lab", "subnet": "10.0.0.0/24" },
            "portForwarding": [{ "name": "web", "protocol": "TCP",
                "externalPort": 8080, "internalIP": "10.0.0.5" }]
        }"#;
        let err = ReconciliationConfig::from_json(json).unwrap_err();
        assert_eq!(field_of(err), "portForwarding[0].internalPort");
    }

    #[test]
    fn test_invalid_protocol() {
        let json = r#"{
            "network": { "name": "lab", "subnet": "10.0.0.0/24" },
            "portForwarding": [{ "name": "x", "protocol": "ICMP", "externalPort": 1,
                "internalIP": "10.0.0.5", "internalPort": 1 }]
        }"#;
        let err = ReconciliationConfig::from_json(json).unwrap_err();
        assert_eq!(field_of(err), "portForwarding[0].protocol");
    }

    #[test]
    fn test_invalid_action() {
        let json = r#"{ "action": "destroy", "network": { "name": "lab", "subnet": "10.0.0.0/24" } }"#;
        let err = ReconciliationConfig::from_json(json).unwrap_err();
        assert_eq!(field_of(err), "action");

        let json = r#"{ "action": "Remove", "network": { "name": "lab", "subnet": "10.0.0.0/24" } }"#;
        let config = ReconciliationConfig::from_json(json).unwrap();
        assert_eq!(config.action, Action::Remove);
    }

    #[test]
    fn test_action_override_skips_file_action() {
        let json = r#"{ "action": "destroy", "network": { "name": "lab", "subnet": "10.0.0.0/24" } }"#;
        let config = ReconciliationConfig::from_json_with_action(json, Some(Action::Remove)).unwrap();
        assert_eq!(config.action, Action::Remove);

        let json = r#"{ "action": "apply", "network": { "name": "lab", "subnet": "10.0.0.0/24" } }"#;
        let config = ReconciliationConfig::from_json_with_action(json, Some(Action::Remove)).unwrap();
        assert_eq!(config.action, Action::Remove);

        // Other fields are still validated
        let json = r#"{ "action": "destroy", "network": { "name": "lab" } }"#;
        let err = ReconciliationConfig::from_json_with_action(json, Some(Action::Apply)).unwrap_err();
        assert_eq!(field_of(err), "network.subnet");
    }

    #[test]
    fn test_missing_fields() {
        let err = ReconciliationConfig::from_json("{}").unwrap_err();
        assert_eq!(field_of(err), "network");

        let err = ReconciliationConfig::from_json(r#"{ "network": { "subnet": "10.0.0.0/24" } }"#)
            .unwrap_err();
        assert_eq!(field_of(err), "network.name");

        let err = ReconciliationConfig::from_json(r#"{ "network": { "name": " " } }"#).unwrap_err();
        assert_eq!(field_of(err), "network.name");

        let err = ReconciliationConfig::from_json(r#"{ "network": { "name": "lab" } }"#).unwrap_err();
        assert_eq!(field_of(err), "network.subnet");
    }

    #[test]
    fn test_duplicate_external_port() {
        let json = r#"{
            "network": { "name": "lab", "subnet": "10.0.0.0/24" },
            "portForwarding": [
                { "name": "a", "protocol": "TCP", "externalPort": 8080, "internalIP": "10.0.0.5", "internalPort": 80 },
                { "name": "b", "protocol": "UDP", "externalPort": 8080, "internalIP": "10.0.0.5", "internalPort": 80 },
                { "name": "c", "protocol": "tcp", "externalPort": 8080, "internalIP": "10.0.0.6", "internalPort": 80 }
            ]
        }"#;
        let err = ReconciliationConfig::from_json(json).unwrap_err();
        assert_eq!(field_of(err), "portForwarding[2].externalPort");
    }

    #[test]
    fn test_parse_error() {
        let err = ReconciliationConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));

        let err = ReconciliationConfig::from_json(r#"{ "network": [] }"#).unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ReconciliationConfig::load(&path).unwrap();
        assert_eq!(config.network.name, "DevNAT");

        let err = ReconciliationConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));

        let bad_action = dir.path().join("bad-action.json");
        std::fs::write(&bad_action, SAMPLE.replace("\"apply\"", "\"destroy\"")).unwrap();
        assert!(ReconciliationConfig::load(&bad_action).is_err());
        let config = ReconciliationConfig::load_with_action(&bad_action, Some(Action::Remove)).unwrap();
        assert_eq!(config.action, Action::Remove);
    }

    #[test]
    fn test_advisories() {
        assert!(ReconciliationConfig::from_json(SAMPLE).unwrap().advisories().is_empty());

        let json = r#"{
            "network": { "name": "lab", "subnet": "10.0.0.0/24" },
            "portForwarding": [{ "name": "web", "protocol": "TCP", "externalPort": 80,
                "internalIP": "10.0.1.5", "internalPort": 80 }],
            "vms": [
                { "name": "a", "ip": "10.0.0.1" },
                { "name": "b", "ip": "dhcp" },
                { "name": "c", "ip": "10.0.0.20" }
            ]
        }"#;
        let notes = ReconciliationConfig::from_json(json).unwrap().advisories();
        assert_eq!(notes.len(), 3);
        assert!(notes[0].contains("'web'"));
        assert!(notes[1].contains("gateway"));
        assert!(notes[2].contains("'dhcp'"));
    }

    #[test]
    fn test_vm_hint_without_address() {
        let json = r#"{
            "network": { "name": "lab", "subnet": "10.0.0.0/24" },
            "vms": [ { "name": "pending", "memo": "address not yet allocated" } ]
        }"#;
        let config = ReconciliationConfig::from_json(json).unwrap();
        assert_eq!(config.vms[0].ip, "");
        let notes = config.advisories();
        assert_eq!(notes, vec!["VM 'pending' has no address".to_string()]);
    }

    #[test]
    fn test_context() {
        let config = ReconciliationConfig::from_json(SAMPLE).unwrap();
        let ctx = config.context();
        assert_eq!(ctx.names.switch, "DevNAT");
        assert_eq!(ctx.gateway, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(ctx.subnet, config.network.subnet);
    }
}
