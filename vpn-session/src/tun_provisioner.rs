// TUN interface provisioner using iproute2

//! Linux tunnel interface management
//!
//! Creates the TUN device with `ip`, assigns addresses and MTU, and installs
//! routes. Catch-all routes go into a dedicated table selected by policy
//! rules that skip packets carrying the table's fwmark, so sockets the engine
//! protects with that mark keep using the physical uplink. DNS is handed to
//! systemd-resolved when available.

use crate::error::ProvisionError;
use crate::provisioner::{InterfaceParams, InterfaceProvisioner, TunHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME: usize = 15;

const SYSFS_NET: &str = "/sys/class/net";

/// Validates that a name is safe to use in shell commands.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    // Check for valid characters: alphanumeric, hyphen, underscore
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validates an interface name for use in `ip` invocations and sysfs paths.
///
/// # Errors
///
/// Returns an error if the name is empty, longer than 15 bytes, or contains
/// characters other than alphanumerics, hyphens, and underscores.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")?;
    if name.len() > MAX_INTERFACE_NAME {
        anyhow::bail!(
            "Interface name '{}' is longer than {} characters",
            name,
            MAX_INTERFACE_NAME
        );
    }
    Ok(())
}

/// Address family flag for `ip`
fn family_flag(ipv4: bool) -> &'static str {
    if ipv4 {
        "-4"
    } else {
        "-6"
    }
}

/// Map a failed command's stderr to a provisioning error
fn classify_failure(command: &str, stderr: &str) -> ProvisionError {
    let detail = format!("{}: {}", command, stderr.trim());
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        ProvisionError::PermissionDenied(detail)
    } else {
        ProvisionError::Rejected(detail)
    }
}

/// Run a command, mapping failures to [`ProvisionError`]
async fn run(program: &str, args: &[&str]) -> Result<(), ProvisionError> {
    let command = format!("{} {}", program, args.join(" "));
    log::debug!("Running: {}", command);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProvisionError::Unavailable(format!("failed to execute {}: {}", program, e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(classify_failure(&command, &stderr))
}

async fn ip(args: &[&str]) -> Result<(), ProvisionError> {
    run("ip", args).await
}

/// Provisioner for a named TUN device
#[derive(Debug, Clone)]
pub struct IpTunProvisioner {
    interface: String,
    route_table: String,
    /// Directory listing one entry per network device
    sysfs_root: PathBuf,
}

impl IpTunProvisioner {
    /// Create a provisioner for the named interface
    ///
    /// # Errors
    ///
    /// Returns an error if the interface name is not safe for shell use.
    pub fn new(interface: String, route_table: u32) -> Result<Self> {
        validate_interface_name(&interface)?;
        Ok(Self {
            interface,
            route_table: route_table.to_string(),
            sysfs_root: PathBuf::from(SYSFS_NET),
        })
    }

    /// Look devices up under `root` instead of `/sys/class/net`
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Check if the interface currently exists
    pub async fn exists(&self) -> bool {
        let output = Command::new("ip")
            .args(["link", "show", "dev", &self.interface])
            .output()
            .await;

        match output {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn configure(&self, params: &InterfaceParams) -> Result<(), ProvisionError> {
        let name = self.interface.as_str();
        let mtu = params.mtu.to_string();
        ip(&["link", "set", "dev", name, "mtu", &mtu]).await?;

        for address in &params.addresses {
            ip(&["addr", "add", &address.to_string(), "dev", name]).await?;
        }

        ip(&["link", "set", "dev", name, "up"]).await?;

        for route in &params.routes {
            let family = family_flag(route.is_ipv4());
            let prefix = route.to_string();
            if route.is_catch_all() {
                ip(&[family, "route", "add", &prefix, "dev", name, "table", &self.route_table])
                    .await?;
            } else {
                ip(&[family, "route", "add", &prefix, "dev", name]).await?;
            }
        }

        for ipv4 in self.catch_all_families(params) {
            self.add_policy_rules(ipv4).await?;
        }

        if params.metered {
            log::debug!("Metered hint has no effect on Linux");
        }

        Ok(())
    }

    /// Families (true = IPv4) that have a catch-all route
    fn catch_all_families(&self, params: &InterfaceParams) -> Vec<bool> {
        let mut families = Vec::new();
        for ipv4 in [true, false] {
            if params
                .routes
                .iter()
                .any(|r| r.is_catch_all() && r.is_ipv4() == ipv4)
            {
                families.push(ipv4);
            }
        }
        families
    }

    async fn add_policy_rules(&self, ipv4: bool) -> Result<(), ProvisionError> {
        let family = family_flag(ipv4);
        let table = self.route_table.as_str();
        ip(&[family, "rule", "add", "not", "fwmark", table, "table", table]).await?;
        ip(&[
            family,
            "rule",
            "add",
            "table",
            "main",
            "suppress_prefixlength",
            "0",
        ])
        .await
    }

    async fn remove_policy_rules(&self, ipv4: bool) {
        let family = family_flag(ipv4);
        let table = self.route_table.as_str();
        let _ = ip(&[family, "rule", "del", "not", "fwmark", table, "table", table]).await;
        let _ = ip(&[
            family,
            "rule",
            "del",
            "table",
            "main",
            "suppress_prefixlength",
            "0",
        ])
        .await;
    }

    /// Point systemd-resolved at the tunnel resolvers; failures are warnings
    async fn apply_dns(&self, params: &InterfaceParams) {
        if params.dns_servers.is_empty() {
            return;
        }

        let servers: Vec<String> = params.dns_servers.iter().map(|s| s.to_string()).collect();
        let mut args = vec!["dns", self.interface.as_str()];
        args.extend(servers.iter().map(String::as_str));

        if let Err(e) = run("resolvectl", &args).await {
            log::warn!("Failed to apply DNS servers: {}", e);
            return;
        }

        if params.has_catch_all() {
            if let Err(e) = run("resolvectl", &["domain", &self.interface, "~."]).await {
                log::warn!("Failed to route DNS queries through {}: {}", self.interface, e);
            }
        }

        log::info!("DNS servers on {}: {}", self.interface, servers.join(", "));
    }

    /// Delete the device; a device that is already gone counts as deleted
    async fn delete_link(&self) -> Result<(), ProvisionError> {
        match ip(&["link", "delete", "dev", &self.interface]).await {
            Ok(()) => Ok(()),
            Err(ProvisionError::Rejected(detail)) if detail.contains("Cannot find device") => {
                log::debug!("Interface {} already gone", self.interface);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl InterfaceProvisioner for IpTunProvisioner {
    async fn provision(&self, params: &InterfaceParams) -> Result<TunHandle, ProvisionError> {
        if self.exists().await {
            log::warn!("Removing stale interface {}", self.interface);
            self.delete_link().await?;
        }

        ip(&["tuntap", "add", "dev", &self.interface, "mode", "tun"]).await?;

        if let Err(e) = self.configure(params).await {
            log::error!("Failed to configure {}: {}", self.interface, e);
            for ipv4 in self.catch_all_families(params) {
                self.remove_policy_rules(ipv4).await;
            }
            if let Err(cleanup) = self.delete_link().await {
                log::warn!("Failed to remove {} after error: {}", self.interface, cleanup);
            }
            return Err(e);
        }

        self.apply_dns(params).await;

        log::info!(
            "Interface {} is up ({}, mtu {}) for {}",
            self.interface,
            params
                .addresses
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            params.mtu,
            params.label
        );

        Ok(TunHandle::new(self.interface.clone(), params.clone()))
    }

    async fn release(&self, handle: TunHandle) -> Result<(), ProvisionError> {
        for ipv4 in self.catch_all_families(handle.params()) {
            self.remove_policy_rules(ipv4).await;
        }

        if !handle.params().dns_servers.is_empty() {
            let _ = run("resolvectl", &["revert", handle.name()]).await;
        }

        self.delete_link().await?;
        log::info!("Interface {} removed", handle.name());
        Ok(())
    }

    fn is_present(&self, name: &str) -> bool {
        self.sysfs_root.join(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IpPrefix;

    fn params(routes: Vec<IpPrefix>) -> InterfaceParams {
        InterfaceParams {
            label: "Test".to_string(),
            mtu: 1500,
            addresses: vec!["172.19.0.1/30".parse().unwrap()],
            dns_servers: vec![],
            routes,
            metered: false,
        }
    }

    #[test]
    fn test_validate_interface_name_valid() {
        assert!(validate_interface_name("vpns0").is_ok());
        assert!(validate_interface_name("tun-vpn").is_ok());
        assert!(validate_interface_name("tun_vpn").is_ok());
        assert!(validate_interface_name(&"a".repeat(15)).is_ok());
    }

    #[test]
    fn test_validate_interface_name_invalid() {
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("tun0; rm -rf /").is_err());
        assert!(validate_interface_name("tun0 && reboot").is_err());
        assert!(validate_interface_name("tun0|cat").is_err());
        assert!(validate_interface_name("tun0$(id)").is_err());
        assert!(validate_interface_name("tun0\n").is_err());
        assert!(validate_interface_name("../etc").is_err());
        assert!(validate_interface_name(&"a".repeat(16)).is_err());
    }

    #[test]
    fn test_new_rejects_unsafe_name() {
        assert!(IpTunProvisioner::new("vpns0".to_string(), 51830).is_ok());
        assert!(IpTunProvisioner::new("vpn s0".to_string(), 51830).is_err());
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "ip tuntap add dev vpns0 mode tun",
            "ioctl(TUNSETIFF): Operation not permitted\n",
        );
        assert!(matches!(err, ProvisionError::PermissionDenied(_)));

        let err = classify_failure("ip addr add", "RTNETLINK answers: Permission denied");
        assert!(matches!(err, ProvisionError::PermissionDenied(_)));

        let err = classify_failure("ip link set", "Cannot find device \"vpns0\"");
        assert_eq!(
            err,
            ProvisionError::Rejected("ip link set: Cannot find device \"vpns0\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let err = run("vpn-session-no-such-tool", &["--version"])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Unavailable(_)));
    }

    #[test]
    fn test_catch_all_families() {
        let provisioner = IpTunProvisioner::new("vpns0".to_string(), 51830).unwrap();

        let v4_only = params(vec![IpPrefix::default_v4(), "10.0.0.0/8".parse().unwrap()]);
        assert_eq!(provisioner.catch_all_families(&v4_only), vec![true]);

        let dual = params(vec![IpPrefix::default_v4(), IpPrefix::default_v6()]);
        assert_eq!(provisioner.catch_all_families(&dual), vec![true, false]);

        let split = params(vec!["10.0.0.0/8".parse().unwrap()]);
        assert!(provisioner.catch_all_families(&split).is_empty());
    }

    #[test]
    fn test_is_present_follows_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = IpTunProvisioner::new("vpns0".to_string(), 51830)
            .unwrap()
            .with_sysfs_root(root.path());

        assert!(!provisioner.is_present("vpns0"));

        std::fs::create_dir(root.path().join("vpns0")).unwrap();
        assert!(provisioner.is_present("vpns0"));

        // Deleted from outside, e.g. `ip link delete`
        std::fs::remove_dir(root.path().join("vpns0")).unwrap();
        assert!(!provisioner.is_present("vpns0"));
    }

    #[test]
    fn test_family_flag() {
        assert_eq!(family_flag(true), "-4");
        assert_eq!(family_flag(false), "-6");
    }
}
