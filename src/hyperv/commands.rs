//! PowerShell wrappers for Hyper-V switch and NetNat commands

use crate::config::PortForwardingRule;
use crate::host::{IpAssignment, NetworkHost, StaticMapping};
use crate::{Error, Result};
use base64::Engine;
use ipnetwork::Ipv4Network;
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::process::Command;

/// Host networking through `powershell.exe`
#[derive(Debug, Clone)]
pub struct PowerShellHost {
    executable: String,
}

impl Default for PowerShellHost {
    fn default() -> Self {
        Self {
            executable: "powershell".to_string(),
        }
    }
}

impl PowerShellHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different PowerShell binary, e.g. `pwsh`
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Check that the Hyper-V and NetNat cmdlets are present
    pub fn is_available(&self) -> Result<bool> {
        let output = self.run(
            "Get-Command",
            "if ((Get-Command New-VMSwitch -ErrorAction SilentlyContinue) -and (Get-Command New-NetNat -ErrorAction SilentlyContinue)) { 'true' } else { 'false' }",
        )?;
        Ok(parse_bool(&output))
    }

    /// Fail early when the host cannot run a reconciliation
    pub fn preflight(&self) -> Result<()> {
        if !is_elevated() {
            return Err(Error::InsufficientPrivileges);
        }
        if !self.is_available()? {
            return Err(Error::HyperVNotAvailable);
        }
        Ok(())
    }

    /// Execute a script, mapping a non-zero exit to a host operation error
    fn run(&self, operation: &str, script: &str) -> Result<String> {
        tracing::debug!(operation, script, "Running PowerShell");

        let encoded = encode_command(&format!("$ErrorActionPreference = 'Stop'\n{}", script));
        let output = Command::new(&self.executable)
            .args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-EncodedCommand",
                encoded.as_str(),
            ])
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::host(
                operation,
                format!(
                    "Exit code: {:?}\nStderr: {}\nStdout: {}",
                    output.status.code(),
                    stderr.trim(),
                    stdout.trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn query_list<T: DeserializeOwned>(&self, operation: &str, script: &str) -> Result<Vec<T>> {
        let output = self.run(operation, script)?;
        parse_json_list(&output).map_err(|e| Error::host(operation, format!("unexpected output: {}", e)))
    }
}

impl NetworkHost for PowerShellHost {
    fn switch_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(
            "Get-VMSwitch",
            &exists_script(&format!(
                "Get-VMSwitch -Name '{}' -ErrorAction SilentlyContinue",
                escape_ps(name)
            )),
        )?;
        Ok(parse_bool(&output))
    }

    fn create_switch(&self, name: &str) -> Result<()> {
        self.run(
            "New-VMSwitch",
            &format!(
                "New-VMSwitch -SwitchName '{}' -SwitchType Internal | Out-Null",
                escape_ps(name)
            ),
        )?;
        Ok(())
    }

    fn remove_switch(&self, name: &str) -> Result<()> {
        self.run(
            "Remove-VMSwitch",
            &format!("Remove-VMSwitch -Name '{}' -Force", escape_ps(name)),
        )?;
        Ok(())
    }

    fn find_ip_assignments(&self, ip: Ipv4Addr) -> Result<Vec<IpAssignment>> {
        self.query_list(
            "Get-NetIPAddress",
            &format!(
                "@(Get-NetIPAddress -IPAddress '{}' -AddressFamily IPv4 -ErrorAction SilentlyContinue | \
                 Select-Object IPAddress, InterfaceAlias, InterfaceIndex, PrefixLength) | ConvertTo-Json -Compress",
                ip
            ),
        )
    }

    fn assign_ip(&self, interface_alias: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.run(
            "New-NetIPAddress",
            &format!(
                "New-NetIPAddress -IPAddress '{}' -PrefixLength {} -InterfaceAlias '{}' | Out-Null",
                ip,
                prefix_len,
                escape_ps(interface_alias)
            ),
        )?;
        Ok(())
    }

    fn remove_ip(&self, assignment: &IpAssignment) -> Result<()> {
        self.run(
            "Remove-NetIPAddress",
            &format!(
                "Remove-NetIPAddress -IPAddress '{}' -InterfaceIndex {} -Confirm:$false",
                assignment.ip_address, assignment.interface_index
            ),
        )?;
        Ok(())
    }

    fn nat_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(
            "Get-NetNat",
            &exists_script(&format!(
                "Get-NetNat -Name '{}' -ErrorAction SilentlyContinue",
                escape_ps(name)
            )),
        )?;
        Ok(parse_bool(&output))
    }

    fn create_nat(&self, name: &str, internal_prefix: Ipv4Network) -> Result<()> {
        self.run(
            "New-NetNat",
            &format!(
                "New-NetNat -Name '{}' -InternalIPInterfaceAddressPrefix '{}' | Out-Null",
                escape_ps(name),
                internal_prefix
            ),
        )?;
        Ok(())
    }

    fn remove_nat(&self, name: &str) -> Result<()> {
        self.run(
            "Remove-NetNat",
            &format!("Remove-NetNat -Name '{}' -Confirm:$false", escape_ps(name)),
        )?;
        Ok(())
    }

    fn list_static_mappings(&self, nat_name: &str) -> Result<Vec<StaticMapping>> {
        self.query_list(
            "Get-NetNatStaticMapping",
            &format!(
                "@(Get-NetNatStaticMapping -NatName '{}' -ErrorAction SilentlyContinue | \
                 Select-Object StaticMappingID, @{{N='Protocol';E={{$_.Protocol.ToString()}}}}, ExternalPort, InternalIPAddress, InternalPort) | \
                 ConvertTo-Json -Compress",
                escape_ps(nat_name)
            ),
        )
    }

    fn add_static_mapping(&self, nat_name: &str, rule: &PortForwardingRule) -> Result<()> {
        self.run(
            "Add-NetNatStaticMapping",
            &static_mapping_script(nat_name, rule),
        )?;
        Ok(())
    }

    fn remove_static_mapping(&self, nat_name: &str, mapping_id: u32) -> Result<()> {
        self.run(
            "Remove-NetNatStaticMapping",
            &format!(
                "Remove-NetNatStaticMapping -NatName '{}' -StaticMappingID {} -Confirm:$false",
                escape_ps(nat_name),
                mapping_id
            ),
        )?;
        Ok(())
    }
}

fn exists_script(query: &str) -> String {
    format!("if ({}) {{ 'true' }} else {{ 'false' }}", query)
}

fn static_mapping_script(nat_name: &str, rule: &PortForwardingRule) -> String {
    format!(
        "Add-NetNatStaticMapping -NatName '{}' -Protocol {} -ExternalIPAddress '0.0.0.0' -ExternalPort {} \
         -InternalIPAddress '{}' -InternalPort {} | Out-Null",
        escape_ps(nat_name),
        rule.protocol,
        rule.external_port,
        rule.internal_ip,
        rule.internal_port
    )
}

fn parse_bool(output: &str) -> bool {
    output.trim().eq_ignore_ascii_case("true")
}

/// ConvertTo-Json emits nothing for no objects and a bare object for one
fn parse_json_list<T: DeserializeOwned>(output: &str) -> serde_json::Result<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }

    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
    } else {
        Ok(vec![serde_json::from_str(trimmed)?])
    }
}

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects
fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Escape string for a single-quoted PowerShell literal
pub fn escape_ps(s: &str) -> String {
    s.replace('\'', "''")
}

/// `net session` only succeeds from an elevated prompt
pub fn is_elevated() -> bool {
    Command::new("net")
        .args(["session"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn test_escape_ps() {
        assert_eq!(escape_ps("test"), "test");
        assert_eq!(escape_ps("test's"), "test''s");
    }

    #[test]
    fn test_encode_command() {
        // "ab" in UTF-16LE is 61 00 62 00
        assert_eq!(encode_command("ab"), "YQBiAA==");
    }

    #[test]
    fn test_parse_json_list_shapes() {
        let none: Vec<IpAssignment> = parse_json_list("  \r\n").unwrap();
        assert!(none.is_empty());

        let single = r#"{"IPAddress":"10.0.0.1","InterfaceAlias":"vEthernet (lab)","InterfaceIndex":17,"PrefixLength":24}"#;
        let one: Vec<IpAssignment> = parse_json_list(single).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].interface_index, 17);

        let many = format!("[{},{}]", single, single.replace("17", "18"));
        let two: Vec<IpAssignment> = parse_json_list(&many).unwrap();
        assert_eq!(two[1].interface_index, 18);

        assert!(parse_json_list::<IpAssignment>("WARNING: something").is_err());
    }

    #[test]
    fn test_static_mapping_script() {
        let rule = PortForwardingRule {
            name: "rdp".into(),
            protocol: Protocol::Tcp,
            external_port: 50001,
            internal_ip: Ipv4Addr::new(192, 168, 100, 10),
            internal_port: 3389,
        };
        let script = static_mapping_script("o'brien-nat", &rule);
        assert!(script.contains("-NatName 'o''brien-nat'"));
        assert!(script.contains("-Protocol TCP"));
        assert!(script.contains("-ExternalPort 50001"));
        assert!(script.contains("-InternalIPAddress '192.168.100.10' -InternalPort 3389"));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("True\r\n"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
