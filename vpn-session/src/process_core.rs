// External tunnel engine controller

//! Tunnel core backed by an external engine process
//!
//! The payload is staged to a private file, the engine binary is spawned
//! against it and supervised: an exit the controller did not ask for is
//! reported as a fault. Traffic counters come from the kernel's per-interface
//! statistics.

use crate::error::CoreError;
use crate::provisioner::TunHandle;
use crate::tunnel_core::{CoreContext, CoreHandle, FaultReporter, TunnelCore};
use crate::types::{EngineConfig, IpPrefix, Traffic, TunOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Name of the staged payload inside the work directory
const STAGED_CONFIG: &str = "engine-config.json";

/// Environment variable carrying the interface name to the engine
const INTERFACE_ENV: &str = "VPN_SESSION_INTERFACE";

/// How long the engine gets to exit after SIGTERM before it is killed
const STOP_GRACE: Duration = Duration::from_secs(3);

/// How long to wait for trailing stderr after the engine exits
const STDERR_DRAIN: Duration = Duration::from_millis(200);

const SYSFS_NET: &str = "/sys/class/net";

/// Tunnel core that runs an engine binary per session
#[derive(Debug, Clone)]
pub struct ProcessCore {
    command: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    startup_grace: Duration,
    stats_root: PathBuf,
}

impl ProcessCore {
    /// Engine described by the `[engine]` section
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            stats_root: PathBuf::from(SYSFS_NET),
        }
    }

    /// Read interface counters below `root` instead of sysfs
    pub fn with_stats_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.stats_root = root.into();
        self
    }

    /// Substitute `{config}` and `{interface}` in the configured arguments
    fn expand_args(&self, config_path: &Path, interface: &str) -> Vec<String> {
        let config_path = config_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config_path)
                    .replace("{interface}", interface)
            })
            .collect()
    }

    /// Write the payload where the engine can read it, owner-only
    fn stage(&self, config: &str) -> Result<PathBuf, CoreError> {
        fs::create_dir_all(&self.work_dir).map_err(CoreError::Staging)?;

        let path = self.work_dir.join(STAGED_CONFIG);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(CoreError::Staging)?;
        file.write_all(config.as_bytes())
            .map_err(CoreError::Staging)?;

        Ok(path)
    }
}

#[async_trait]
impl TunnelCore for ProcessCore {
    fn negotiated_options(&self, config: &str) -> Option<TunOptions> {
        parse_tun_inbound(config)
    }

    async fn start(
        &self,
        config: &str,
        tun: &TunHandle,
        ctx: CoreContext,
    ) -> Result<Arc<dyn CoreHandle>, CoreError> {
        let config_path = self.stage(config)?;
        let args = self.expand_args(&config_path, tun.name());

        log::info!(
            "Starting tunnel engine: {} {}",
            self.command.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .env(INTERFACE_ENV, tun.name())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Spawn)?;

        let last_line = Arc::new(Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, last_line.clone())));

        tokio::select! {
            status = child.wait() => {
                if let Some(task) = stderr_task {
                    let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
                }
                let reason = match status {
                    Ok(status) => describe_exit(status, &last_line),
                    Err(e) => format!("failed to wait for engine: {}", e),
                };
                return Err(CoreError::Exited(reason));
            }
            _ = tokio::time::sleep(self.startup_grace) => {}
        }

        log::info!(
            "Tunnel engine running (pid {}) on {}",
            child.id().unwrap_or(0),
            tun.name()
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(supervise(child, stop_rx, ctx.faults, last_line));

        Ok(Arc::new(ProcessHandle {
            stop: Mutex::new(Some(stop_tx)),
            watcher: Mutex::new(Some(watcher)),
            stats: InterfaceStats::new(&self.stats_root, tun.name()),
        }))
    }
}

/// A running engine process
struct ProcessHandle {
    stop: Mutex<Option<oneshot::Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stats: InterfaceStats,
}

#[async_trait]
impl CoreHandle for ProcessHandle {
    async fn stop(&self) {
        let stop = self.stop.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let watcher = self.watcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                log::warn!("Engine supervisor task failed: {}", e);
            }
        }
    }

    fn traffic(&self) -> Option<Traffic> {
        self.stats.read()
    }
}

/// Wait for the engine to exit or for a stop request
async fn supervise(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    faults: FaultReporter,
    last_line: Arc<Mutex<String>>,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => describe_exit(status, &last_line),
                Err(e) => format!("failed to wait for engine: {}", e),
            };
            log::error!("Tunnel engine stopped unexpectedly: {}", reason);
            faults.report(format!("Tunnel engine stopped: {}", reason));
        }
        // Also fires when the handle is dropped without stop()
        _ = stop => terminate(&mut child).await,
    }
}

/// SIGTERM, then SIGKILL after [`STOP_GRACE`]
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling our own child, which has not been reaped yet
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret == 0 {
            if let Ok(Ok(status)) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
                log::info!("Tunnel engine stopped ({})", status);
                return;
            }
            log::warn!("Tunnel engine ignored SIGTERM, killing");
        }
    }

    match child.kill().await {
        Ok(()) => log::info!("Tunnel engine killed"),
        Err(e) => log::warn!("Failed to kill tunnel engine: {}", e),
    }
}

/// Forward engine stderr to the log, remembering the last line
async fn forward_stderr(stderr: ChildStderr, last_line: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("engine: {}", line);
        if !line.trim().is_empty() {
            *last_line.lock().unwrap_or_else(|p| p.into_inner()) = line;
        }
    }
}

fn describe_exit(status: ExitStatus, last_line: &Mutex<String>) -> String {
    let last = last_line.lock().unwrap_or_else(|p| p.into_inner());
    if last.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, last.trim())
    }
}

/// Kernel counters of one interface
#[derive(Debug, Clone)]
struct InterfaceStats {
    rx_path: PathBuf,
    tx_path: PathBuf,
}

impl InterfaceStats {
    fn new(root: &Path, interface: &str) -> Self {
        let dir = root.join(interface).join("statistics");
        Self {
            rx_path: dir.join("rx_bytes"),
            tx_path: dir.join("tx_bytes"),
        }
    }

    /// Bytes the engine delivered to the host count as inbound
    fn read(&self) -> Option<Traffic> {
        Some(Traffic {
            bytes_in: read_counter(&self.rx_path)?,
            bytes_out: read_counter(&self.tx_path)?,
        })
    }
}

fn read_counter(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Interface options from the payload's `tun` inbound, when it has one
///
/// Understands the `address` list as well as the older `inet4_address` /
/// `inet6_address` keys, plus `mtu`, `auto_route` and `route_address`.
/// Resolvers come from the top-level `dns.servers` section; only entries
/// naming a literal IP address are used.
pub fn parse_tun_inbound(config: &str) -> Option<TunOptions> {
    let root: Value = serde_json::from_str(config).ok()?;
    let inbound = root
        .get("inbounds")?
        .as_array()?
        .iter()
        .find(|inbound| inbound.get("type").and_then(Value::as_str) == Some("tun"))?;

    let mut options = TunOptions::default();
    for key in ["address", "inet4_address", "inet6_address"] {
        options.addresses.extend(prefixes(inbound.get(key)));
    }
    options.routes = prefixes(inbound.get("route_address"));
    options.mtu = inbound
        .get("mtu")
        .and_then(Value::as_u64)
        .and_then(|mtu| u16::try_from(mtu).ok());
    options.auto_route = inbound.get("auto_route").and_then(Value::as_bool);
    options.dns_servers = dns_servers(&root);

    Some(options)
}

/// Literal resolver addresses from `dns.servers`
///
/// Accepts both the `address` form (`8.8.8.8`, `tls://1.1.1.1`,
/// `udp://[2606:4700::1111]:53`) and the typed `server` form. Hostnames,
/// `local` and `fakeip` entries are skipped.
fn dns_servers(root: &Value) -> Vec<IpAddr> {
    let Some(servers) = root
        .get("dns")
        .and_then(|dns| dns.get("servers"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut out: Vec<IpAddr> = Vec::new();
    for server in servers {
        let Some(address) = server
            .get("address")
            .or_else(|| server.get("server"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if let Some(ip) = resolver_ip(address) {
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
    }
    out
}

fn resolver_ip(address: &str) -> Option<IpAddr> {
    let rest = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let host = rest.split('/').next()?;

    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next()?.parse().ok();
    }
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    // host:port
    let (ip, _) = host.rsplit_once(':')?;
    ip.parse::<std::net::Ipv4Addr>().ok().map(IpAddr::V4)
}

/// A string or list of strings in CIDR notation; malformed entries are skipped
fn prefixes(value: Option<&Value>) -> Vec<IpPrefix> {
    match value {
        Some(Value::String(s)) => s.parse().ok().into_iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|s| s.parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}
