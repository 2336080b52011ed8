// Shared session types

//! Shared data structures
//!
//! This module defines the data model shared between components: the
//! session lifecycle states, the events published to the UI layer, the
//! status snapshot, connection descriptors and configuration structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session, nothing held
    Disconnected,
    /// Acquiring interface and tunnel core
    Connecting,
    /// Session live
    Connected,
    /// Releasing resources
    Disconnecting,
    /// Last connect failed, nothing held
    Error,
}

impl SessionState {
    /// Wire name of the state, as seen by the UI layer
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative traffic counters for the live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Bytes delivered to the host through the tunnel
    pub bytes_in: u64,
    /// Bytes sent by the host through the tunnel
    pub bytes_out: u64,
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Current lifecycle state
    pub state: SessionState,
    /// Inbound bytes of the live session, 0 otherwise
    #[serde(rename = "bytesIn")]
    pub bytes_in: u64,
    /// Outbound bytes of the live session, 0 otherwise
    #[serde(rename = "bytesOut")]
    pub bytes_out: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

/// Events published to the single UI subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The session moved to a new state
    StateChanged {
        /// State entered
        state: SessionState,
    },
    /// Periodic counters while connected
    StatsUpdated {
        /// Cumulative inbound bytes
        #[serde(rename = "bytesIn")]
        bytes_in: u64,
        /// Cumulative outbound bytes
        #[serde(rename = "bytesOut")]
        bytes_out: u64,
    },
    /// A failure the user should see
    Error {
        /// Human readable description
        message: String,
    },
}

impl Event {
    /// Build a `StatsUpdated` event from a counter sample
    pub fn stats(traffic: Traffic) -> Self {
        Event::StatsUpdated {
            bytes_in: traffic.bytes_in,
            bytes_out: traffic.bytes_out,
        }
    }
}

/// An IP address with a prefix length, e.g. `172.19.0.1/30` or `::/0`
///
/// The address keeps its host bits so the same type describes interface
/// addresses and routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a prefix, rejecting lengths beyond the address width
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix_len <= max).then_some(Self { addr, prefix_len })
    }

    /// IPv4 catch-all route
    pub const fn default_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// IPv6 catch-all route
    pub const fn default_v6() -> Self {
        Self {
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// Address as written, host bits included
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether the address is IPv4
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// True for `0.0.0.0/0` and `::/0`
    pub fn is_catch_all(&self) -> bool {
        self.prefix_len == 0
    }
}

impl FromStr for IpPrefix {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::config::parse_cidr(s)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Network parameters derived from the host platform, carried by every
/// connection descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkParams {
    /// Interface MTU
    pub mtu: Option<u16>,
    /// Interface addresses
    pub addresses: Vec<IpPrefix>,
    /// Resolvers for the tunnel
    pub dns_servers: Vec<IpAddr>,
    /// Routes sent through the tunnel
    pub routes: Vec<IpPrefix>,
    /// Add catch-all routes
    pub auto_route: bool,
    /// Hint that the uplink is metered
    pub metered: bool,
}

/// Interface options negotiated by the tunnel core for a given payload
///
/// Every field is optional; unset fields fall back to the descriptor's
/// platform-derived values and then to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunOptions {
    /// Interface MTU
    pub mtu: Option<u16>,
    /// Interface addresses
    pub addresses: Vec<IpPrefix>,
    /// Resolvers the engine expects
    pub dns_servers: Vec<IpAddr>,
    /// Routes the engine wants captured
    pub routes: Vec<IpPrefix>,
    /// Whether to add catch-all routes
    pub auto_route: Option<bool>,
}

/// Everything needed to attempt one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Opaque tunnel-core configuration
    pub config: String,
    /// Display name of the remote endpoint
    pub server_label: String,
    /// Platform-derived interface parameters
    pub network: NetworkParams,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Logging and timing
    #[serde(default)]
    pub general: GeneralConfig,
    /// Tunnel interface
    #[serde(default)]
    pub interface: InterfaceConfig,
    /// External tunnel engine
    pub engine: EngineConfig,
    /// Control socket
    #[serde(default)]
    pub control: ControlConfig,
    /// Indicator shown while connected
    #[serde(default)]
    pub surface: SurfaceConfig,
    /// Connect once at daemon start
    #[serde(default)]
    pub autoconnect: Option<AutoConnectConfig>,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// `env_logger` filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Period of `stats_updated` events
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Upper bound on each provisioning, start and release step
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_ms: default_stats_interval_ms(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Tunnel interface configuration (platform-derived network parameters)
#[derive(Debug, Deserialize, Clone)]
pub struct InterfaceConfig {
    /// TUN device name
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Interface addresses
    #[serde(default)]
    pub address: Vec<IpPrefix>,
    /// Resolvers for the tunnel
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Routes sent through the tunnel
    #[serde(default)]
    pub routes: Vec<IpPrefix>,
    /// Add catch-all routes
    #[serde(default = "default_true")]
    pub auto_route: bool,
    /// Routing table for catch-all routes, also used as the fwmark of
    /// protected sockets
    #[serde(default = "default_route_table")]
    pub route_table: u32,
    /// Hint that the uplink is metered
    #[serde(default)]
    pub metered: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            mtu: default_mtu(),
            address: Vec::new(),
            dns: Vec::new(),
            routes: Vec::new(),
            auto_route: true,
            route_table: default_route_table(),
            metered: false,
        }
    }
}

impl InterfaceConfig {
    /// Network parameters attached to every descriptor built by the daemon
    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            mtu: Some(self.mtu),
            addresses: self.address.clone(),
            dns_servers: self.dns.clone(),
            routes: self.routes.clone(),
            auto_route: self.auto_route,
            metered: self.metered,
        }
    }
}

/// External tunnel engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Engine binary
    pub command: PathBuf,
    /// `{config}` and `{interface}` are substituted at start
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    /// Directory the staged configuration is written to
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// How long the engine must stay up to count as started
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

/// Control socket configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Unix socket path
    #[serde(default = "default_control_socket")]
    pub socket: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_control_socket(),
        }
    }
}

/// Which OS surface reflects an active session
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SurfaceKind {
    /// JSON file other tools can watch
    StateFile,
    /// Persistent desktop notification
    Notification,
    /// No indicator
    #[serde(rename = "none")]
    Disabled,
}

/// Status surface configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SurfaceConfig {
    /// Which surface to use
    #[serde(default = "default_surface_kind")]
    pub kind: SurfaceKind,
    /// Path for the `state-file` surface
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            kind: default_surface_kind(),
            state_file: default_state_file(),
        }
    }
}

/// Connection profile used at daemon start
#[derive(Debug, Deserialize, Clone)]
pub struct AutoConnectConfig {
    /// File holding the tunnel-core payload
    pub config_path: PathBuf,
    /// Label shown for the session
    #[serde(default)]
    pub server_name: Option<String>,
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval_ms() -> u64 {
    1000
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_interface_name() -> String {
    "vpns0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_true() -> bool {
    true
}

fn default_route_table() -> u32 {
    51830
}

fn default_engine_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string(), "{config}".to_string()]
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/run/vpn-session")
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/vpn-session/control.sock")
}

fn default_surface_kind() -> SurfaceKind {
    SurfaceKind::StateFile
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/run/vpn-session/state")
}
