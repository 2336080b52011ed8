// Error types

//! Error taxonomy for the session controller and its collaborators

use std::fmt;
use thiserror::Error;

/// Failures of a connect attempt or of the session lifecycle
///
/// The `Display` text of a variant is the message carried by the
/// `error` event.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Payload missing or unusable
    #[error("{0}")]
    ConfigurationInvalid(String),

    /// The tunnel interface could not be set up
    #[error("Failed to establish VPN interface: {0}")]
    InterfaceProvisioningFailed(#[from] ProvisionError),

    /// The tunnel engine did not come up
    #[error("Tunnel core failed to start: {0}")]
    TunnelCoreStartFailed(#[from] CoreError),

    /// A session is already starting or live
    #[error("VPN already running")]
    AlreadyRunning,

    /// The system withdrew the right to run the VPN
    #[error("VPN permission revoked")]
    PermissionRevoked,

    /// Best-effort release failed; logged, never surfaced as a failed session
    #[error("Failed to release {0}")]
    ResourceReleaseFailed(String),

    /// The controller no longer accepts requests
    #[error("Session controller has shut down")]
    Stopped,
}

impl SessionError {
    /// Error for a connect request with no usable payload
    pub fn empty_configuration() -> Self {
        SessionError::ConfigurationInvalid("Configuration is empty".to_string())
    }
}

/// Interface provisioning failures, distinguished by cause
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// The OS refused for lack of privilege
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The OS refused the request itself
    #[error("rejected by the system: {0}")]
    Rejected(String),

    /// Tooling or facility missing
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Did not finish within the step timeout
    #[error("timed out")]
    TimedOut,
}

/// Tunnel core start failures
#[derive(Debug, Error)]
pub enum CoreError {
    /// Writing the payload for the engine failed
    #[error("failed to stage configuration: {0}")]
    Staging(#[source] std::io::Error),

    /// The engine process could not be launched
    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    /// The engine quit inside the startup grace period
    #[error("engine exited during startup ({0})")]
    Exited(String),

    /// The engine refused the payload
    #[error("engine rejected configuration: {0}")]
    Rejected(String),

    /// Did not start within the step timeout
    #[error("timed out")]
    TimedOut,
}

/// Platform capabilities a tunnel core may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Keep an engine socket off the tunnel
    ProtectSocket,
    /// List host network interfaces
    InterfaceEnumeration,
    /// Find the uid owning a connection
    ConnectionOwner,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::ProtectSocket => "socket protection",
            Capability::InterfaceEnumeration => "interface enumeration",
            Capability::ConnectionOwner => "connection owner lookup",
        };
        f.write_str(name)
    }
}

/// Platform capability failures
#[derive(Debug, Error)]
pub enum PlatformError {
    /// No implementation registered for the capability
    #[error("{0} is not supported on this platform")]
    Unsupported(Capability),

    /// The implementation ran and failed
    #[error("{capability} failed: {source}")]
    Failed {
        /// Capability that failed
        capability: Capability,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_configuration_message() {
        assert_eq!(
            SessionError::empty_configuration().to_string(),
            "Configuration is empty"
        );
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::from(ProvisionError::PermissionDenied(
            "Operation not permitted".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "Failed to establish VPN interface: permission denied: Operation not permitted"
        );

        let err = SessionError::from(CoreError::Exited("exit status: 1".to_string()));
        assert_eq!(
            err.to_string(),
            "Tunnel core failed to start: engine exited during startup (exit status: 1)"
        );

        assert_eq!(SessionError::AlreadyRunning.to_string(), "VPN already running");
        assert_eq!(
            SessionError::PermissionRevoked.to_string(),
            "VPN permission revoked"
        );
    }

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::Unsupported(Capability::ConnectionOwner);
        assert_eq!(
            err.to_string(),
            "connection owner lookup is not supported on this platform"
        );
    }
}
