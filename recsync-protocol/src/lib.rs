//! Recorder Sync Protocol Implementation
//!
//! This library implements the sync protocol spoken by BLE voice recorders:
//! framing, stream reassembly, file listing, file download with stall
//! detection and WAV repair, and connection state tracking.
//!
//! [`SyncEngine`] is the synchronous core and can be driven by hand or by a
//! fake transport. [`RecorderClient`] runs the engine on a tokio task over
//! any [`Transport`].

pub mod client;
pub mod dispatcher;
pub mod download;
pub mod engine;
pub mod events;
pub mod file_list;
pub mod packet;
pub mod reassembler;
pub mod state;
pub mod status;
pub mod timer;
pub mod transport;
pub mod wav;

mod error;

pub use client::{Download, FileListing, RecorderClient};
pub use dispatcher::{Route, SessionMode};
pub use download::{DownloadedFile, Progress};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{ProtocolError, Result};
pub use events::{DownloadEvent, ListEvent};
pub use file_list::DeviceFileEntry;
pub use packet::{Decoded, Packet};
pub use reassembler::{StreamReassembler, StreamStats};
pub use state::{ConnectionState, ConnectionStateMachine};
pub use status::{DeviceStatus, StorageCapacity};
pub use transport::{
    ChannelWriter, Endpoint, FrameWriter, SimulatedFile, SimulatedRecorder, SimulatorConfig,
    SimulatorHandle, Transport, TransportCapabilities, TransportEvent,
};
#[cfg(feature = "bluetooth")]
pub use transport::{BluetoothConfig, BluetoothTransport};
pub use wav::AudioFormat;

#[cfg(test)]
pub mod test_utils;
