//! Transport Trait Abstraction
//!
//! Defines the seam between the protocol engine and whatever carries its
//! bytes. The engine itself only needs [`FrameWriter`]; the async client
//! additionally needs [`Transport`] to open the link and receive
//! notifications.

use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt::{self, Debug};
use tokio::sync::mpsc;

/// Conservative default for a single GATT write (ATT MTU 23 minus 3 bytes of header)
pub const DEFAULT_MAX_WRITE_SIZE: usize = 20;

/// Transport capabilities and characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Largest byte count accepted by one write
    pub max_write_size: usize,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
        }
    }
}

/// Notification endpoints exposed by the recorder
///
/// The data endpoint carries CONTROL and FILE_TRANSFER replies interleaved;
/// the status endpoint carries CONTROL replies only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Data,
    Status,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Data => write!(f, "data"),
            Endpoint::Status => write!(f, "status"),
        }
    }
}

/// Events delivered by a connected transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived on a notify endpoint
    Notification { endpoint: Endpoint, bytes: Vec<u8> },

    /// The link went down without being asked to
    Disconnected { reason: Option<String> },
}

/// Synchronous, fire-and-forget byte sink used by the engine
///
/// Implementations must not block. A failed write is reported to the engine,
/// which logs it and moves on.
pub trait FrameWriter: Send {
    /// Queue bytes for transmission
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Largest byte count accepted by one call to [`FrameWriter::write`]
    fn max_write_size(&self) -> usize {
        DEFAULT_MAX_WRITE_SIZE
    }
}

/// [`FrameWriter`] that forwards writes to an async task through a channel
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    max_write_size: usize,
}

impl ChannelWriter {
    pub fn new(max_write_size: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                max_write_size: max_write_size.max(1),
            },
            rx,
        )
    }
}

impl FrameWriter for ChannelWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| ProtocolError::Transport("write queue closed".to_string()))
    }

    fn max_write_size(&self) -> usize {
        self.max_write_size
    }
}

/// Common transport interface for recorder links
#[async_trait]
pub trait Transport: Send + Debug {
    /// Get transport capabilities
    fn capabilities(&self) -> TransportCapabilities;

    /// Establish the link and start receiving notifications
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::DeviceNotFound` when no recorder could be
    /// located, or a transport error when the link could not be set up.
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Write bytes to the command endpoint
    ///
    /// Never called with more than `capabilities().max_write_size` bytes.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if the link is currently up
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Data.to_string(), "data");
        assert_eq!(Endpoint::Status.to_string(), "status");
    }

    #[test]
    fn test_channel_writer_forwards_bytes() {
        let (mut writer, mut rx) = ChannelWriter::new(64);
        writer.write(&[1, 2, 3]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(writer.max_write_size(), 64);
    }

    #[test]
    fn test_channel_writer_reports_closed_queue() {
        let (mut writer, rx) = ChannelWriter::new(0);
        drop(rx);

        assert!(matches!(
            writer.write(&[0]),
            Err(ProtocolError::Transport(_))
        ));
        assert_eq!(writer.max_write_size(), 1);
    }
}
