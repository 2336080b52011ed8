// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents, including CIDR parsing and range checks.

use crate::tun_provisioner::validate_interface_name;
use crate::types::{Config, IpPrefix};
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Smallest MTU accepted for the tunnel interface
const MIN_MTU: u16 = 576;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    validate_interface_name(&config.interface.name).context("Invalid interface.name")?;

    if config.interface.mtu < MIN_MTU {
        anyhow::bail!(
            "interface.mtu must be >= {}, got {}",
            MIN_MTU,
            config.interface.mtu
        );
    }

    if config.interface.route_table == 0 {
        anyhow::bail!("interface.route_table must be > 0");
    }

    if config.engine.command.as_os_str().is_empty() {
        anyhow::bail!("engine.command cannot be empty");
    }

    if config.general.stats_interval_ms == 0 {
        anyhow::bail!("stats_interval_ms must be > 0");
    }

    if config.general.step_timeout_secs == 0 {
        anyhow::bail!("step_timeout_secs must be > 0");
    }

    if config.control.socket.as_os_str().is_empty() {
        anyhow::bail!("control.socket cannot be empty");
    }

    if let Some(auto) = &config.autoconnect {
        if auto.config_path.as_os_str().is_empty() {
            anyhow::bail!("autoconnect.config_path cannot be empty");
        }
    }

    Ok(())
}

/// Parse CIDR notation (IPv4 or IPv6) into an [`IpPrefix`]
///
/// Host bits are preserved; interface addresses need them.
pub fn parse_cidr(cidr: &str) -> Result<IpPrefix> {
    let parts: Vec<&str> = cidr.split('/').collect();
    if parts.len() != 2 {
        anyhow::bail!("Invalid CIDR format (expected ADDRESS/N)");
    }

    let ip: IpAddr = parts[0].parse().context("Invalid IP address")?;
    let prefix_len: u8 = parts[1].parse().context("Invalid prefix length")?;

    IpPrefix::new(ip, prefix_len).with_context(|| {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        format!("Prefix length must be <= {}", max)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SurfaceKind;
    use std::io::Write;

    const MINIMAL: &str = r#"
[engine]
command = "/usr/bin/sing-box"
"#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_parse_cidr() {
        let prefix = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(prefix.addr(), "192.168.1.0".parse::<IpAddr>().unwrap());
        assert_eq!(prefix.prefix_len(), 24);

        let prefix = parse_cidr("10.0.0.1/32").unwrap();
        assert_eq!(prefix.prefix_len(), 32);

        let prefix = parse_cidr("fdfe:dcba:9876::1/126").unwrap();
        assert!(!prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 126);
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("invalid").is_err());
        assert!(parse_cidr("192.168.1.0").is_err());
        assert!(parse_cidr("192.168.1.0/").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("999.999.999.999/24").is_err());
        assert!(parse_cidr("::/129").is_err());
        assert!(parse_cidr("10.0.0.0/8/8").is_err());
    }

    #[test]
    fn test_parse_cidr_edge_cases() {
        assert!(parse_cidr("0.0.0.0/0").unwrap().is_catch_all());
        assert!(parse_cidr("::/0").unwrap().is_catch_all());
        assert!(parse_cidr("10.0.0.0/31").is_ok());
        assert!(parse_cidr("255.255.255.255/32").is_ok());
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = parse(MINIMAL);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.stats_interval_ms, 1000);
        assert_eq!(config.general.step_timeout_secs, 30);
        assert_eq!(config.interface.name, "vpns0");
        assert_eq!(config.interface.mtu, 1500);
        assert!(config.interface.auto_route);
        assert_eq!(config.interface.route_table, 51830);
        assert_eq!(config.engine.args, vec!["run", "-c", "{config}"]);
        assert_eq!(config.engine.startup_grace_ms, 500);
        assert_eq!(config.surface.kind, SurfaceKind::StateFile);
        assert!(config.autoconnect.is_none());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
[general]
log_level = "debug"
stats_interval_ms = 250

[interface]
name = "tun-vpn"
mtu = 1400
address = ["172.19.0.1/30", "fdfe:dcba:9876::1/126"]
dns = ["9.9.9.9", "2620:fe::fe"]
routes = ["10.0.0.0/8"]
auto_route = false
metered = true

[engine]
command = "/opt/engine/bin/engine"
args = ["-c", "{config}", "--tun", "{interface}"]

[surface]
kind = "none"

[autoconnect]
config_path = "/etc/vpn-session/profile.json"
server_name = "Home"
"#,
        );
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.interface.address.len(), 2);
        assert_eq!(config.interface.dns.len(), 2);
        assert!(!config.interface.auto_route);
        assert!(config.interface.metered);
        assert_eq!(config.surface.kind, SurfaceKind::Disabled);
        let auto = config.autoconnect.unwrap();
        assert_eq!(auto.server_name.as_deref(), Some("Home"));
    }

    #[test]
    fn test_invalid_cidr_rejected_at_parse() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[interface]
address = ["172.19.0.1"]

[engine]
command = "/usr/bin/sing-box"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_engine_rejected() {
        let result: Result<Config, _> = toml::from_str("[general]\nlog_level = \"info\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_config() {
        let config = parse(MINIMAL);

        // Shell metacharacters in interface name
        let mut bad = config.clone();
        bad.interface.name = "tun0; rm -rf /".to_string();
        assert!(validate_config(&bad).is_err());

        // Longer than IFNAMSIZ - 1
        let mut bad = config.clone();
        bad.interface.name = "a".repeat(16);
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.interface.mtu = 500;
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.interface.route_table = 0;
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.engine.command = "".into();
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.general.stats_interval_ms = 0;
        assert!(validate_config(&bad).is_err());

        let mut bad = config.clone();
        bad.general.step_timeout_secs = 0;
        assert!(validate_config(&bad).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.engine.command, Path::new("/usr/bin/sing-box"));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/vpn-session.toml").is_err());
    }
}
