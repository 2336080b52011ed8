// OS status surface

//! Reflects an active session outside the daemon
//!
//! The controller calls [`StatusSurface::session_active`] once a session is
//! connected and [`StatusSurface::session_inactive`] once it is torn down.
//! Implementations log their own failures; they never affect the session.

use crate::notifier::DesktopNotifier;
use crate::state_file::StateFile;
use crate::types::{SurfaceConfig, SurfaceKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Indicator shown while a session is live
#[async_trait]
pub trait StatusSurface: Send + Sync {
    /// A session is live for `server_label`
    async fn session_active(&self, server_label: &str);

    /// No session is live any more
    async fn session_inactive(&self);
}

/// Surface that shows nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSurface;

#[async_trait]
impl StatusSurface for NoSurface {
    async fn session_active(&self, _server_label: &str) {}

    async fn session_inactive(&self) {}
}

/// Build the configured surface
///
/// A desktop notifier that cannot reach the session bus degrades to
/// [`NoSurface`] with a warning.
pub async fn from_config(config: &SurfaceConfig) -> Arc<dyn StatusSurface> {
    match config.kind {
        SurfaceKind::StateFile => Arc::new(StateFile::new(config.state_file.clone())),
        SurfaceKind::Notification => match DesktopNotifier::connect().await {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                log::warn!("Desktop notifications unavailable, continuing without: {:#}", e);
                Arc::new(NoSurface)
            }
        },
        SurfaceKind::Disabled => Arc::new(NoSurface),
    }
}
