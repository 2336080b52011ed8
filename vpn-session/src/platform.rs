// Platform capabilities exposed to tunnel engines

//! Reverse control channel from the tunnel core to the host platform
//!
//! A [`CapabilitySet`] carries optional providers. Asking for a capability
//! without a provider yields [`PlatformError::Unsupported`] rather than a
//! silent default. Calls are synchronous and never go through the session
//! controller's queue.

use crate::error::PlatformError;
pub use crate::error::Capability;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

/// Keeps an engine's own sockets out of the tunnel
pub trait SocketProtector: Send + Sync {
    /// Route `fd` around the tunnel
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// One address of a host network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    /// OS interface name
    pub name: String,
    /// One address assigned to it
    pub addr: IpAddr,
    /// Loopback device
    pub is_loopback: bool,
}

/// Enumerates host network interfaces
pub trait InterfaceLister: Send + Sync {
    /// One entry per interface address
    fn interfaces(&self) -> io::Result<Vec<NetInterface>>;
}

/// A connection whose owning user is being looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionQuery {
    /// IP protocol number (6 = TCP, 17 = UDP)
    pub protocol: u8,
    /// Local end
    pub source: SocketAddr,
    /// Remote end
    pub destination: SocketAddr,
}

/// Maps a connection to the uid that owns it
pub trait ConnectionOwnerLookup: Send + Sync {
    /// Uid owning the connection
    fn owner_uid(&self, query: &ConnectionQuery) -> io::Result<u32>;
}

/// Platform capabilities available to tunnel engines
#[derive(Clone, Default)]
pub struct CapabilitySet {
    protector: Option<Arc<dyn SocketProtector>>,
    lister: Option<Arc<dyn InterfaceLister>>,
    owner: Option<Arc<dyn ConnectionOwnerLookup>>,
}

impl CapabilitySet {
    /// Empty set: every capability is unsupported
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer socket protection
    pub fn with_socket_protector(mut self, protector: impl SocketProtector + 'static) -> Self {
        self.protector = Some(Arc::new(protector));
        self
    }

    /// Offer interface enumeration
    pub fn with_interface_lister(mut self, lister: impl InterfaceLister + 'static) -> Self {
        self.lister = Some(Arc::new(lister));
        self
    }

    /// Offer connection owner lookup
    pub fn with_connection_owner(mut self, owner: impl ConnectionOwnerLookup + 'static) -> Self {
        self.owner = Some(Arc::new(owner));
        self
    }

    /// Whether a provider is registered for `capability`
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ProtectSocket => self.protector.is_some(),
            Capability::InterfaceEnumeration => self.lister.is_some(),
            Capability::ConnectionOwner => self.owner.is_some(),
        }
    }

    /// Exempt a socket from the tunnel's routes
    pub fn protect(&self, fd: RawFd) -> Result<(), PlatformError> {
        let protector = self
            .protector
            .as_ref()
            .ok_or(PlatformError::Unsupported(Capability::ProtectSocket))?;
        protector.protect(fd).map_err(|source| PlatformError::Failed {
            capability: Capability::ProtectSocket,
            source,
        })
    }

    /// Host interfaces and their addresses
    pub fn interfaces(&self) -> Result<Vec<NetInterface>, PlatformError> {
        let lister = self
            .lister
            .as_ref()
            .ok_or(PlatformError::Unsupported(Capability::InterfaceEnumeration))?;
        lister.interfaces().map_err(|source| PlatformError::Failed {
            capability: Capability::InterfaceEnumeration,
            source,
        })
    }

    /// Uid owning a connection
    pub fn connection_owner(&self, query: &ConnectionQuery) -> Result<u32, PlatformError> {
        let owner = self
            .owner
            .as_ref()
            .ok_or(PlatformError::Unsupported(Capability::ConnectionOwner))?;
        owner.owner_uid(query).map_err(|source| PlatformError::Failed {
            capability: Capability::ConnectionOwner,
            source,
        })
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySet")
            .field("protect_socket", &self.protector.is_some())
            .field("interface_enumeration", &self.lister.is_some())
            .field("connection_owner", &self.owner.is_some())
            .finish()
    }
}

/// Marks sockets with `SO_MARK` so the policy rules route them around the tunnel
#[derive(Debug, Clone, Copy)]
pub struct FwmarkProtector {
    mark: u32,
}

impl FwmarkProtector {
    /// Protector setting `mark` on every socket
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }
}

impl SocketProtector for FwmarkProtector {
    #[cfg(target_os = "linux")]
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        let mark: libc::c_uint = self.mark;
        // SAFETY: `mark` outlives the call and the length matches its type;
        // an invalid fd is reported by the kernel as EBADF.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn protect(&self, _fd: RawFd) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_MARK is only available on Linux",
        ))
    }
}

/// Host interfaces as reported by `getifaddrs`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceLister for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| NetInterface {
                addr: iface.ip(),
                is_loopback: iface.is_loopback(),
                name: iface.name,
            })
            .collect())
    }
}
