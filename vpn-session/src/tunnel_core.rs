// Tunnel core adapter contract

//! Tunnel core adapter
//!
//! The tunnel core is the engine that actually moves packets. The controller
//! only knows it through [`TunnelCore`] (start an engine for a payload on an
//! interface) and [`CoreHandle`] (stop it, read its counters). Engines talk
//! back through [`CoreContext`]: platform capabilities and a fault reporter
//! bound to the session that started them.

use crate::error::CoreError;
use crate::platform::CapabilitySet;
use crate::provisioner::TunHandle;
use crate::types::{Traffic, TunOptions};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Starts tunnel engines
#[async_trait]
pub trait TunnelCore: Send + Sync {
    /// Interface options the engine wants for this payload, if it has an opinion
    fn negotiated_options(&self, _config: &str) -> Option<TunOptions> {
        None
    }

    /// Start an engine bound to `tun`
    async fn start(
        &self,
        config: &str,
        tun: &TunHandle,
        ctx: CoreContext,
    ) -> Result<Arc<dyn CoreHandle>, CoreError>;
}

/// A running engine instance
#[async_trait]
pub trait CoreHandle: Send + Sync {
    /// Stop the engine; safe to call more than once
    async fn stop(&self);

    /// Current cumulative counters, if the engine can tell
    fn traffic(&self) -> Option<Traffic>;
}

/// Lets a running engine report an unexpected stop
///
/// Reporting drives the normal disconnect path for the session the engine
/// belongs to. Reports from an engine whose session already ended are ignored.
#[derive(Clone)]
pub struct FaultReporter {
    sink: Arc<dyn Fn(String) + Send + Sync>,
}

impl FaultReporter {
    /// Reporter that hands every reason to `sink`
    pub fn new(sink: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Reporter that discards everything
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report that the engine stopped on its own
    pub fn report(&self, reason: impl Into<String>) {
        (self.sink)(reason.into());
    }
}

impl fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReporter").finish_non_exhaustive()
    }
}

/// What an engine receives when it starts
#[derive(Clone, Debug)]
pub struct CoreContext {
    /// Host capabilities the engine may call
    pub platform: Arc<CapabilitySet>,
    /// Reporter bound to the starting session
    pub faults: FaultReporter,
}
