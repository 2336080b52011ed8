// Command surface for the UI layer

//! Request/response entry points
//!
//! Translates external calls into controller operations. `connect` only
//! reports whether the request was admitted; progress arrives as events.

use crate::controller::SessionController;
use crate::types::{ConnectionDescriptor, Event, NetworkParams, Status};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label used when the caller does not name the server
pub const DEFAULT_SERVER_LABEL: &str = "VPN Server";

/// Outcome of a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    /// Admitted; progress follows as events
    Accepted,
    /// Refused with a reason, no events emitted
    Rejected(String),
}

/// Entry points shared by every transport
#[derive(Clone)]
pub struct CommandSurface {
    controller: Arc<SessionController>,
    network: NetworkParams,
}

impl CommandSurface {
    /// `network` is attached to every connection descriptor
    pub fn new(controller: Arc<SessionController>, network: NetworkParams) -> Self {
        Self {
            controller,
            network,
        }
    }

    /// Request a session for `config`
    ///
    /// A missing or blank label falls back to [`DEFAULT_SERVER_LABEL`].
    pub fn connect(&self, config: String, server_label: Option<String>) -> ConnectReply {
        let server_label = server_label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_LABEL.to_string());

        let descriptor = ConnectionDescriptor {
            config,
            server_label,
            network: self.network.clone(),
        };

        match self.controller.connect(descriptor) {
            Ok(_) => ConnectReply::Accepted,
            Err(e) => {
                log::info!("Connect rejected: {}", e);
                ConnectReply::Rejected(e.to_string())
            }
        }
    }

    /// Always acknowledged
    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    /// Current state and counters
    pub fn get_status(&self) -> Status {
        self.controller.status()
    }

    /// Take the event subscription, replacing any previous subscriber
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.controller.events().subscribe()
    }
}
