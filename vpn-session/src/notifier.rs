// Desktop notification surface via D-Bus

//! Persistent "connected" notification
//!
//! Talks to the freedesktop notification server on the session bus. The
//! notification is replaced in place while a session is live and closed when
//! it ends.

use crate::surface::StatusSurface;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use zbus::zvariant::Value;
use zbus::{proxy, Connection};

const APP_NAME: &str = "vpn-session";
const ICON: &str = "network-vpn";

/// Never expire; the notification stays until the session ends
const EXPIRE_NEVER: i32 = 0;

/// D-Bus proxy for the notification server
#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    /// Show or replace a notification, returning its id
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, &Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;

    fn close_notification(&self, id: u32) -> zbus::Result<()>;
}

/// Notification-based status surface
pub struct DesktopNotifier {
    proxy: NotificationsProxy<'static>,
    /// Id of the notification currently shown, 0 when none
    current: Mutex<u32>,
}

impl DesktopNotifier {
    /// Connect to the session bus
    pub async fn connect() -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to D-Bus session bus")?;
        let proxy = NotificationsProxy::new(&connection)
            .await
            .context("Failed to create notifications proxy")?;

        Ok(Self {
            proxy,
            current: Mutex::new(0),
        })
    }

    fn current(&self) -> u32 {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_current(&self, id: u32) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = id;
    }
}

/// Body text of the connected notification
fn connected_body(server_label: &str) -> String {
    format!("Connected to {}", server_label)
}

#[async_trait]
impl StatusSurface for DesktopNotifier {
    async fn session_active(&self, server_label: &str) {
        let result = self
            .proxy
            .notify(
                APP_NAME,
                self.current(),
                ICON,
                "VPN Connected",
                &connected_body(server_label),
                &[],
                HashMap::new(),
                EXPIRE_NEVER,
            )
            .await;

        match result {
            Ok(id) => self.set_current(id),
            Err(e) => log::warn!("Failed to show notification: {}", e),
        }
    }

    async fn session_inactive(&self) {
        let id = self.current();
        if id == 0 {
            return;
        }
        self.set_current(0);

        if let Err(e) = self.proxy.close_notification(id).await {
            log::debug!("Failed to close notification {}: {}", id, e);
        }
    }
}
