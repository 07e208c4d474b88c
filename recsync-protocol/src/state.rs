//! Connection State Machine
//!
//! ```text
//! Idle --connect--> Searching --link up--> Connected --sync start--> Syncing
//!   ^                  |                     ^   |                     |
//!   |               not found                |   +------sync end-------+
//!   +------------------+--------disconnect---+---------------------------
//!
//! any state --unsolicited link loss--> Disconnected --connect--> Searching
//! ```
//!
//! Transitions are the only mutation, and every transition is broadcast to
//! subscribers. Subscribers only observe; they cannot force a transition.

use crate::events::Subscribers;
use crate::{ProtocolError, Result};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Link state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Searching,
    Connected,
    Syncing,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Searching => "searching",
            ConnectionState::Connected => "connected",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Owner of [`ConnectionState`]
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    subscribers: Subscribers<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            subscribers: Subscribers::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subscribe to transitions; the receiver first gets the current state
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.subscribers.subscribe(self.state)
    }

    /// Idle or Disconnected -> Searching
    pub fn connect_requested(&mut self) -> Result<()> {
        self.transition(
            &[ConnectionState::Idle, ConnectionState::Disconnected],
            ConnectionState::Searching,
        )
    }

    /// Searching -> Connected
    pub fn link_established(&mut self) -> Result<()> {
        self.transition(&[ConnectionState::Searching], ConnectionState::Connected)
    }

    /// Searching -> Idle, when the recorder was not found or the scan was cancelled
    pub fn search_failed(&mut self) -> Result<()> {
        self.transition(&[ConnectionState::Searching], ConnectionState::Idle)
    }

    /// Connected -> Syncing
    pub fn sync_started(&mut self) -> Result<()> {
        self.transition(&[ConnectionState::Connected], ConnectionState::Syncing)
    }

    /// Syncing -> Connected
    pub fn sync_ended(&mut self) -> Result<()> {
        self.transition(&[ConnectionState::Syncing], ConnectionState::Connected)
    }

    /// Any state -> Idle, on a caller-requested disconnect
    pub fn disconnect_requested(&mut self) {
        self.set(ConnectionState::Idle);
    }

    /// Any state -> Disconnected, on an unsolicited link loss
    pub fn link_lost(&mut self) {
        self.set(ConnectionState::Disconnected);
    }

    fn transition(&mut self, from: &[ConnectionState], to: ConnectionState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(ProtocolError::invalid_state(format!(
                "cannot move from {} to {}",
                self.state, to
            )));
        }
        self.set(to);
        Ok(())
    }

    fn set(&mut self, to: ConnectionState) {
        if self.state == to {
            debug!("Connection state already {}", to);
            return;
        }

        info!("Connection state {} -> {}", self.state, to);
        self.state = to;
        self.subscribers.broadcast(&to);
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
