//! Error handling for the recorder sync protocol
//!
//! This module provides the error type shared by every engine component.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Recovered locally (never surfaced)
//! - Framing errors: a frame that does not start with the magic byte. The
//!   stream reassembler drops bytes up to the next magic byte and logs a warning.
//! - Decode errors: a device filename that is neither GBK nor UTF-8. The file
//!   list reassembler substitutes a placeholder name.
//!
//! ### Surfaced to the caller
//! - `Device`: the recorder finished an import with a non-zero status code
//! - `Stalled`: no file data arrived within the watchdog window
//! - `LinkLost`: the transport dropped the link while a request was in flight
//! - `Cancelled`: the caller disconnected while a request was in flight
//! - `InvalidState`: a request was made while another session is active, or
//!   while the link is not in the `Connected` state
//!
//! ### Logging Errors
//!
//! Transport write failures are logged with `tracing::warn!` and never retried
//! by the engine:
//!
//! ```rust,ignore
//! if let Err(e) = self.writer.write(chunk) {
//!     warn!("Failed to write frame seq={}: {}", seq, e);
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
///
/// This is a type alias for `Result<T, ProtocolError>` that simplifies
/// error handling throughout the engine.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use recsync_protocol::ProtocolError;
///
/// let error = ProtocolError::Device { status: 3 };
/// assert_eq!(error.to_string(), "Device reported failure status 3");
///
/// let error = ProtocolError::invalid_state("download already in progress");
/// assert_eq!(error.to_string(), "Invalid state: download already in progress");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// I/O error reported by a transport
    ///
    /// Kept as a message so the error stays `Clone` and can be delivered to
    /// every subscriber of a failed request.
    #[error("IO error: {0}")]
    Io(String),

    /// Transport layer error (GATT, simulated link, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// No recorder matching the configured address or name was found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Malformed or unexpected packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The recorder completed an import with a non-zero status code
    #[error("Device reported failure status {status}")]
    Device {
        /// Raw status byte from the import-complete packet
        status: u8,
    },

    /// No file data arrived within the watchdog window
    #[error("Transfer stalled after {received} of {total} bytes")]
    Stalled {
        /// Bytes received before the stall
        received: u32,
        /// Declared file size
        total: u32,
    },

    /// The transport dropped the link unexpectedly
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration is invalid or missing
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(error: std::io::Error) -> Self {
        ProtocolError::from_io_error(error, "transport I/O")
    }
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use recsync_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "no response");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to recorder");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::NotFound => {
                ProtocolError::DeviceNotFound(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::LinkLost(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(format!("{}: {}", context, error)),
        }
    }

    /// Check if this error is recoverable (the same request may succeed on retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use recsync_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::Stalled { received: 10, total: 100 };
    /// assert!(error.is_recoverable());
    ///
    /// let error = ProtocolError::Configuration("bad uuid".to_string());
    /// assert!(!error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Stalled { .. }
                | ProtocolError::LinkLost(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Io(_)
                | ProtocolError::Transport(_)
        )
    }

    /// Check if this error ended an in-flight transfer
    pub fn is_transfer_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::Device { .. }
                | ProtocolError::Stalled { .. }
                | ProtocolError::LinkLost(_)
                | ProtocolError::Cancelled(_)
        )
    }

    /// Get a user-friendly error message suitable for display in UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::Device { status } => {
                format!(
                    "The recorder could not send the file (status {}). Try again.",
                    status
                )
            }
            ProtocolError::Stalled { received, total } => {
                format!(
                    "Transfer stalled at {} of {} bytes. Move the recorder closer and retry.",
                    received, total
                )
            }
            ProtocolError::LinkLost(_) => {
                "Connection to the recorder was lost. Reconnect and retry.".to_string()
            }
            ProtocolError::DeviceNotFound(_) => {
                "Recorder not found. Make sure it is switched on and in range.".to_string()
            }
            ProtocolError::InvalidState(msg) => {
                format!("Busy: {}.", msg)
            }
            ProtocolError::Cancelled(msg) => {
                format!("Operation cancelled: {}.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Timed out: {}. Check the Bluetooth connection.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::InvalidPacket(msg) => {
                format!("Invalid data received: {}.", msg)
            }
            ProtocolError::Transport(msg) => {
                format!("Transport error: {}. Check the Bluetooth adapter.", msg)
            }
            ProtocolError::Io(msg) => {
                format!("I/O error: {}.", msg)
            }
        }
    }

    /// Create an invalid state error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use recsync_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::invalid_state("file list fetch in progress");
    /// assert!(matches!(error, ProtocolError::InvalidState(_)));
    /// ```
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }
}
