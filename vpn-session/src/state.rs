// State manager for session lifecycle

//! State machine for session lifecycle management
//!
//! This module implements the pure transition table that decides what the
//! controller's worker does next. It holds no resources: the worker feeds it
//! commands, executes the returned action and publishes the resulting state.

use crate::types::SessionState;

/// Commands that trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    /// A connect request won the running flag
    Connect,
    /// Interface provisioned and tunnel core started
    Established,
    /// A connect step failed
    Failed,
    /// Disconnect requested (user, engine fault, revocation or shutdown)
    Disconnect,
    /// All session resources released
    TornDown,
}

/// Actions to take in response to state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    /// Validate, provision the interface, start the tunnel core
    Establish,
    /// Surface the session and start the stats ticker
    Activate,
    /// Release whatever the failed attempt acquired
    Rollback,
    /// Release the session's resources
    Teardown,
    /// Reset counters and clear the OS surface
    Finish,
    /// No action needed
    None,
}

/// State machine manager
pub struct StateManager {
    state: SessionState,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    /// Create a new state manager
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    /// Handle a state command and return the action to take
    pub fn handle_command(&mut self, cmd: StateCommand) -> StateAction {
        log::debug!("State: {:?}, Command: {:?}", self.state, cmd);

        match (self.state, cmd) {
            // New attempt, from rest or after a failure
            (SessionState::Disconnected, StateCommand::Connect)
            | (SessionState::Error, StateCommand::Connect) => {
                self.state = SessionState::Connecting;
                StateAction::Establish
            }

            (SessionState::Connecting, StateCommand::Established) => {
                log::info!("Session established");
                self.state = SessionState::Connected;
                StateAction::Activate
            }

            (SessionState::Connecting, StateCommand::Failed) => {
                log::warn!("Connect attempt failed, rolling back");
                self.state = SessionState::Error;
                StateAction::Rollback
            }

            // A disconnect that raced a failed connect still settles in disconnected
            (SessionState::Connected, StateCommand::Disconnect)
            | (SessionState::Error, StateCommand::Disconnect) => {
                log::info!("Disconnecting");
                self.state = SessionState::Disconnecting;
                StateAction::Teardown
            }

            (SessionState::Disconnecting, StateCommand::TornDown) => {
                log::info!("Session torn down");
                self.state = SessionState::Disconnected;
                StateAction::Finish
            }

            // Ignore other combinations
            _ => {
                log::debug!(
                    "No action for state {:?} with command {:?}",
                    self.state,
                    cmd
                );
                StateAction::None
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }
}
