//! Engine Event System
//!
//! Events emitted by the engine to its callers. Each request gets its own
//! channel, so progress events always arrive before the terminal event of
//! the same request.

use crate::download::{DownloadedFile, Progress};
use crate::file_list::DeviceFileEntry;
use crate::ProtocolError;
use tokio::sync::mpsc;

/// Events for one file list request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEvent {
    /// Running list after a new entry arrived
    Partial(Vec<DeviceFileEntry>),

    /// Final list; always the last event of a successful listing
    Complete(Vec<DeviceFileEntry>),

    /// Listing abandoned (disconnect or link loss)
    Failed(ProtocolError),
}

impl ListEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListEvent::Partial(_))
    }
}

/// Events for one download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Non-decreasing progress update
    Progress(Progress),

    /// Finished file; always the last event of a successful download
    Complete(DownloadedFile),

    /// Device error, stall, disconnect or link loss
    Failed(ProtocolError),
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress(_))
    }
}

/// Fan-out of state snapshots to any number of subscribers
///
/// Closed subscribers are pruned on the next broadcast.
#[derive(Debug)]
pub struct Subscribers<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    /// Add a subscriber, seeding it with the current value
    pub fn subscribe(&mut self, current: T) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail
        let _ = tx.send(current);
        self.senders.push(tx);
        rx
    }

    pub fn broadcast(&mut self, value: &T) {
        self.senders.retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl<T: Clone> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}
