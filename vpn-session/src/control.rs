// Control socket for the UI layer

//! JSON-lines control socket
//!
//! Each line on the socket is one request; each request gets one response
//! line. A `subscribe` request turns the connection into the event stream,
//! which ends when another client subscribes.

use crate::commands::{CommandSurface, ConnectReply};
use crate::types::{Event, Status};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Requests accepted on the control socket
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start a session
    Connect {
        /// Tunnel-core payload
        config: String,
        /// Label shown for the session
        #[serde(default)]
        server_name: Option<String>,
    },
    /// Tear down the session, if any
    Disconnect,
    /// Report state and counters
    Status,
    /// Turn the connection into the event stream
    Subscribe,
}

/// Responses written back, one per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Connect admitted
    Accepted,
    /// Connect refused
    Rejected {
        /// Why the request was refused
        reason: String,
    },
    /// Request acknowledged
    Ok,
    /// Answer to `status`
    Status(Status),
    /// Malformed or misplaced request
    Error {
        /// What was wrong with the request
        message: String,
    },
}

impl From<ConnectReply> for ControlResponse {
    fn from(reply: ConnectReply) -> Self {
        match reply {
            ConnectReply::Accepted => ControlResponse::Accepted,
            ConnectReply::Rejected(reason) => ControlResponse::Rejected { reason },
        }
    }
}

/// Unix socket server in front of the command surface
pub struct ControlServer {
    socket_path: PathBuf,
    commands: CommandSurface,
}

impl ControlServer {
    /// Server for `socket_path`; nothing is bound until [`ControlServer::bind`]
    pub fn new(socket_path: impl AsRef<Path>, commands: CommandSurface) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            commands,
        }
    }

    /// Path of the socket file
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one, owner access only
    pub fn bind(&self) -> Result<UnixListener> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!(
                "Failed to bind control socket {}",
                self.socket_path.display()
            )
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                log::warn!("Failed to restrict control socket permissions: {}", e);
            }
        }

        log::info!("Control socket listening on {}", self.socket_path.display());
        Ok(listener)
    }

    /// Accept clients until the listener fails, one task per connection
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener
                .accept()
                .await
                .context("Control socket accept failed")?;

            let commands = self.commands.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, commands).await {
                    log::debug!("Control connection error: {:#}", e);
                }
            });
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(stream: UnixStream, commands: CommandSurface) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                let response = ControlResponse::Error {
                    message: format!("Invalid request: {}", e),
                };
                write_line(&mut writer, &response).await?;
                continue;
            }
        };
        log::debug!("Control request: {:?}", request);

        if request == ControlRequest::Subscribe {
            let events = commands.subscribe();
            write_line(&mut writer, &ControlResponse::Ok).await?;
            return stream_events(&mut writer, events).await;
        }

        let response = handle_request(request, &commands);
        write_line(&mut writer, &response).await?;
    }

    Ok(())
}

/// Answer a non-streaming request
pub fn handle_request(request: ControlRequest, commands: &CommandSurface) -> ControlResponse {
    match request {
        ControlRequest::Connect {
            config,
            server_name,
        } => commands.connect(config, server_name).into(),
        ControlRequest::Disconnect => {
            commands.disconnect();
            ControlResponse::Ok
        }
        ControlRequest::Status => ControlResponse::Status(commands.get_status()),
        ControlRequest::Subscribe => ControlResponse::Error {
            message: "subscribe is only valid as a stream".to_string(),
        },
    }
}

async fn stream_events<W>(writer: &mut W, mut events: mpsc::Receiver<Event>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        write_line(writer, &event).await?;
    }
    log::debug!("Event subscriber replaced");
    Ok(())
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_string(value).context("Failed to serialize response")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write response")?;
    Ok(())
}
