// State file writer for external monitoring
//!
//! Writes the current session state to a file for consumption by external
//! tools like status bar widgets.

use crate::surface::StatusSurface;
use crate::types::SessionState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Runtime state file (`STATE=`, `SERVER=`, `TIMESTAMP=` lines)
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State file at `path`; nothing is written yet
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Location of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write current state to state file
    pub fn write_state(&self, state: SessionState, server: Option<&str>) -> Result<()> {
        // Create directory if it doesn't exist
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create state directory")?;
            }
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let content = format!(
            "STATE={}\nSERVER={}\nTIMESTAMP={}\n",
            state,
            server.unwrap_or(""),
            timestamp
        );

        fs::write(&self.path, content).context("Failed to write state file")?;

        Ok(())
    }

    /// Remove state file on shutdown
    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[async_trait]
impl StatusSurface for StateFile {
    async fn session_active(&self, server_label: &str) {
        if let Err(e) = self.write_state(SessionState::Connected, Some(server_label)) {
            log::warn!("Failed to write state file: {:#}", e);
        }
    }

    async fn session_inactive(&self) {
        if let Err(e) = self.write_state(SessionState::Disconnected, None) {
            log::warn!("Failed to write state file: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(file: &StateFile) -> String {
        fs::read_to_string(file.path()).unwrap()
    }

    #[test]
    fn test_write_state_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state"));

        file.write_state(SessionState::Connected, Some("Home")).unwrap();

        let content = read(&file);
        assert!(content.starts_with("STATE=connected\nSERVER=Home\nTIMESTAMP="));
    }

    #[tokio::test]
    async fn test_surface_updates() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state"));

        file.session_active("Frankfurt").await;
        assert!(read(&file).contains("STATE=connected\nSERVER=Frankfurt\n"));

        file.session_inactive().await;
        assert!(read(&file).contains("STATE=disconnected\nSERVER=\n"));
    }

    #[test]
    fn test_cleanup_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state"));
        file.write_state(SessionState::Disconnected, None).unwrap();

        file.cleanup();
        assert!(!file.path().exists());

        // Second cleanup is harmless
        file.cleanup();
    }
}
