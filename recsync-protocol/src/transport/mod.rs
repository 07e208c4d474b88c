//! Recorder Transport Layer
//!
//! The engine talks to the recorder through a minimal capability interface:
//! a fire-and-forget byte writer plus a stream of inbound notifications and
//! link events. Concrete transports:
//!
//! - [`BluetoothTransport`]: BLE GATT via BlueZ (feature `bluetooth`)
//! - [`SimulatedRecorder`]: an in-process recorder for tests and demos

mod r#trait;
#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod simulated;

use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub use bluetooth::{BluetoothConfig, BluetoothTransport};
pub use r#trait::{
    ChannelWriter, Endpoint, FrameWriter, Transport, TransportCapabilities, TransportEvent,
    DEFAULT_MAX_WRITE_SIZE,
};
pub use simulated::{SimulatedFile, SimulatedRecorder, SimulatorConfig, SimulatorHandle};

/// Recorder sync service
pub const RECORDER_SERVICE_UUID: Uuid = uuid::uuid!("0000fff0-0000-1000-8000-00805f9b34fb");

/// Command characteristic (write)
pub const RECORDER_WRITE_CHAR_UUID: Uuid = uuid::uuid!("0000fff2-0000-1000-8000-00805f9b34fb");

/// Data characteristic (notify, CONTROL and FILE_TRANSFER replies)
pub const RECORDER_DATA_CHAR_UUID: Uuid = uuid::uuid!("0000fff1-0000-1000-8000-00805f9b34fb");

/// Status characteristic (notify, CONTROL replies only)
pub const RECORDER_STATUS_CHAR_UUID: Uuid = uuid::uuid!("0000fff3-0000-1000-8000-00805f9b34fb");
