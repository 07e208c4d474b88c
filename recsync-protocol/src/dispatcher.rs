//! Command Dispatcher
//!
//! Decides where a decoded packet goes. Routing depends only on the packet's
//! `(channel, command)` pair and on which session currently owns the
//! FILE_TRANSFER stream; FILE_DATA payloads are never inspected.

use crate::packet::{channel, command, Packet};
use std::fmt;

/// Which session currently owns FILE_TRANSFER traffic
///
/// Listing and downloading are mutually exclusive, so a flag is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Idle,
    Listing,
    Downloading,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Idle => write!(f, "idle"),
            SessionMode::Listing => write!(f, "listing"),
            SessionMode::Downloading => write!(f, "downloading"),
        }
    }
}

/// Destination of a decoded packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// CONTROL reply for the device status snapshot
    Status,

    /// Directory records for the file list reassembler
    ListData,

    /// Explicit end of listing
    ListComplete,

    /// The recorder accepted the import request
    ImportStarted,

    /// File content for the download reassembler
    DownloadData,

    /// End of import with the device status code (0 = success)
    ImportComplete { status: u8 },

    /// Nothing to do with this packet
    Ignore(&'static str),
}

/// Check if a packet must be acknowledged before it is routed
pub fn needs_ack(packet: &Packet) -> bool {
    packet.is_file_transfer()
}

/// Route a packet given the current session mode
pub fn route(packet: &Packet, mode: SessionMode) -> Route {
    match (packet.channel(), packet.command()) {
        (channel::CONTROL, command::BATTERY_REPLY)
        | (channel::CONTROL, command::CAPACITY_REPLY)
        | (channel::CONTROL, command::VERSION_REPLY) => Route::Status,
        (channel::CONTROL, _) => Route::Ignore("unknown control command"),

        (channel::FILE_TRANSFER, command::LIST_REPLY) => match mode {
            SessionMode::Listing => Route::ListData,
            _ => Route::Ignore("list reply outside a listing"),
        },
        (channel::FILE_TRANSFER, command::LIST_COMPLETE) => match mode {
            SessionMode::Listing => Route::ListComplete,
            _ => Route::Ignore("list complete outside a listing"),
        },
        (channel::FILE_TRANSFER, command::FILE_DATA) => match mode {
            SessionMode::Listing => Route::ListData,
            SessionMode::Downloading => Route::DownloadData,
            SessionMode::Idle => Route::Ignore("file data without a session"),
        },
        (channel::FILE_TRANSFER, command::IMPORT_STARTED) => match mode {
            SessionMode::Downloading => Route::ImportStarted,
            _ => Route::Ignore("import started without a download"),
        },
        (channel::FILE_TRANSFER, command::IMPORT_COMPLETE) => match mode {
            SessionMode::Downloading => Route::ImportComplete {
                // A bare IMPORT_COMPLETE means success
                status: packet.payload().first().copied().unwrap_or(0),
            },
            _ => Route::Ignore("import complete without a download"),
        },
        (channel::FILE_TRANSFER, _) => Route::Ignore("unknown file transfer command"),

        _ => Route::Ignore("unknown channel"),
    }
}
