// Interface provisioner contract

//! Virtual interface provisioning
//!
//! Defines the [`InterfaceProvisioner`] seam the controller acquires the
//! tunnel interface through, and the policy that turns negotiated options
//! and descriptor parameters into one concrete interface request.

use crate::error::ProvisionError;
use crate::types::{ConnectionDescriptor, IpPrefix, TunOptions};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

/// MTU used when neither the tunnel core nor the descriptor supply one
pub const DEFAULT_MTU: u16 = 1500;

/// Interface address used when none is supplied
const DEFAULT_ADDRESS: (Ipv4Addr, u8) = (Ipv4Addr::new(172, 19, 0, 1), 30);

/// Public resolvers used when no DNS server is supplied
pub const FALLBACK_DNS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

/// Concrete request handed to the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceParams {
    /// Session label shown by the OS for the interface
    pub label: String,
    /// Interface MTU
    pub mtu: u16,
    /// At most one IPv4 and one IPv6 address
    pub addresses: Vec<IpPrefix>,
    /// Resolvers, never empty
    pub dns_servers: Vec<IpAddr>,
    /// Routes through the interface, catch-alls included
    pub routes: Vec<IpPrefix>,
    /// Hint that the uplink is metered
    pub metered: bool,
}

impl InterfaceParams {
    /// Whether any route captures all traffic of a family
    pub fn has_catch_all(&self) -> bool {
        self.routes.iter().any(IpPrefix::is_catch_all)
    }
}

/// An acquired tunnel interface
///
/// Owned by the session; handed back to [`InterfaceProvisioner::release`]
/// exactly once.
#[derive(Debug)]
pub struct TunHandle {
    name: String,
    params: InterfaceParams,
}

impl TunHandle {
    /// Handle for the interface `name` created from `params`
    pub fn new(name: impl Into<String>, params: InterfaceParams) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// OS name of the interface
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters the interface was created with
    pub fn params(&self) -> &InterfaceParams {
        &self.params
    }
}

/// Acquires and releases the virtual network interface
#[async_trait]
pub trait InterfaceProvisioner: Send + Sync {
    /// Create and configure the interface
    async fn provision(&self, params: &InterfaceParams) -> Result<TunHandle, ProvisionError>;

    /// Tear the interface down; an interface that is already gone is not an error
    async fn release(&self, handle: TunHandle) -> Result<(), ProvisionError>;

    /// Whether the interface still exists
    ///
    /// Polled while a session is live; returning false revokes the session.
    fn is_present(&self, _name: &str) -> bool {
        true
    }
}

/// Build the interface request for a descriptor
///
/// Each field is taken from the tunnel core's negotiated options when they
/// supply it, then from the descriptor, then from defaults. Only the first
/// IPv4 and first IPv6 address are used; DNS servers and routes are
/// deduplicated.
pub fn build_params(
    negotiated: Option<&TunOptions>,
    descriptor: &ConnectionDescriptor,
) -> InterfaceParams {
    let network = &descriptor.network;

    let mtu = negotiated
        .and_then(|o| o.mtu)
        .or(network.mtu)
        .unwrap_or(DEFAULT_MTU);

    let candidates = negotiated
        .map(|o| o.addresses.as_slice())
        .filter(|a| !a.is_empty())
        .unwrap_or(network.addresses.as_slice());
    let mut addresses: Vec<IpPrefix> = candidates
        .iter()
        .find(|a| a.is_ipv4())
        .into_iter()
        .chain(candidates.iter().find(|a| !a.is_ipv4()))
        .copied()
        .collect();
    if addresses.is_empty() {
        let (addr, prefix_len) = DEFAULT_ADDRESS;
        addresses.extend(IpPrefix::new(IpAddr::V4(addr), prefix_len));
    }

    let dns_servers = negotiated
        .map(|o| o.dns_servers.as_slice())
        .filter(|d| !d.is_empty())
        .or(Some(network.dns_servers.as_slice()).filter(|d| !d.is_empty()))
        .map(dedup)
        .unwrap_or_else(|| FALLBACK_DNS.to_vec());

    let auto_route = negotiated
        .and_then(|o| o.auto_route)
        .unwrap_or(network.auto_route);
    let explicit_routes = negotiated
        .map(|o| o.routes.as_slice())
        .filter(|r| !r.is_empty())
        .unwrap_or(network.routes.as_slice());

    let mut routes = Vec::new();
    if auto_route || explicit_routes.is_empty() {
        routes.push(IpPrefix::default_v4());
        if addresses.iter().any(|a| !a.is_ipv4()) {
            routes.push(IpPrefix::default_v6());
        }
    }
    routes.extend_from_slice(explicit_routes);

    InterfaceParams {
        label: descriptor.server_label.clone(),
        mtu,
        addresses,
        dns_servers,
        routes: dedup(&routes),
        metered: network.metered,
    }
}

/// Keep the first occurrence of each value, preserving order
fn dedup<T: PartialEq + Copy>(values: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(value) {
            out.push(*value);
        }
    }
    out
}
