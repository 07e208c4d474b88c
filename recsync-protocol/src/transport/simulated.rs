//! Simulated Recorder
//!
//! An in-process recorder that speaks the sync protocol. Every reply is
//! split into notification fragments of a configurable size, so the
//! engine's reassembly paths get exercised without hardware.
//!
//! The simulator can also misbehave on purpose: stream recordings without
//! a WAV header, stall halfway through a file, report a non-zero import
//! status, skip LIST_COMPLETE, or drop the link.

use super::{Endpoint, Transport, TransportCapabilities, TransportEvent, DEFAULT_MAX_WRITE_SIZE};
use crate::file_list::{encode_record, NAME_FIELD_LEN};
use crate::packet::{self, channel, command, Decoded, Packet};
use crate::wav::{self, AudioFormat};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Import status reported for a name the recorder does not have
pub const STATUS_NOT_FOUND: u8 = 0x01;

/// A recording stored on the simulated recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedFile {
    /// Name bytes as stored on the device (at most 20)
    pub raw_name: Vec<u8>,
    /// Timestamp-or-duration field of the directory record
    pub field: u32,
    /// Bytes sent in response to an import request
    pub content: Vec<u8>,
}

impl SimulatedFile {
    pub fn new(name: &str, field: u32, content: Vec<u8>) -> Self {
        Self::with_raw_name(name.as_bytes().to_vec(), field, content)
    }

    pub fn with_raw_name(raw_name: Vec<u8>, field: u32, content: Vec<u8>) -> Self {
        let mut raw_name = raw_name;
        raw_name.truncate(NAME_FIELD_LEN);
        Self {
            raw_name,
            field,
            content,
        }
    }

    /// A WAV recording that carries a proper RIFF header
    pub fn wav(name: &str, field: u32, samples: &[u8], format: AudioFormat) -> Self {
        let mut content = wav::synthesize_header(samples.len(), format).to_vec();
        content.extend_from_slice(samples);
        Self::new(name, field, content)
    }

    fn size_bytes(&self) -> u32 {
        u32::try_from(self.content.len()).unwrap_or(u32::MAX)
    }
}

/// Behaviour of the simulated recorder
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub files: Vec<SimulatedFile>,
    /// Largest notification the recorder emits
    pub fragment_size: usize,
    /// Directory bytes per LIST_REPLY packet
    pub list_chunk_size: usize,
    /// File bytes per FILE_DATA packet
    pub data_chunk_size: usize,
    /// Whether a listing ends with LIST_COMPLETE
    pub send_list_complete: bool,
    /// Stop sending file data after this many bytes and never complete
    pub stall_after: Option<usize>,
    /// Status byte of IMPORT_COMPLETE
    pub import_status: u8,
    pub battery_percent: u8,
    pub used_kib: u32,
    pub total_kib: u32,
    pub firmware_version: String,
    pub max_write_size: usize,
    /// Fail every connection attempt as if the recorder were out of range
    pub unreachable: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            files: demo_files(),
            fragment_size: 20,
            list_chunk_size: 40,
            data_chunk_size: 128,
            send_list_complete: true,
            stall_after: None,
            import_status: 0,
            battery_percent: 76,
            used_kib: 12_288,
            total_kib: 7_812_500,
            firmware_version: "V2.1.7".to_string(),
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            unreachable: false,
        }
    }
}

/// Recordings served when no files are configured explicitly
pub fn demo_files() -> Vec<SimulatedFile> {
    let samples = |len: usize| -> Vec<u8> { (0..len).map(|i| (i % 251) as u8).collect() };

    vec![
        // Raw PCM without a header, as some firmware streams it
        SimulatedFile::new("20240102-153000.WAV", 0, samples(32_000)),
        SimulatedFile::wav(
            "REC002.WAV",
            1_704_272_400,
            &samples(8_000),
            AudioFormat::default(),
        ),
        SimulatedFile::new("memo.mp3", 95, samples(2_000)),
    ]
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    link_dropped: AtomicBool,
    acks: AtomicUsize,
    commands: AtomicUsize,
}

impl Shared {
    fn events(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<TransportEvent>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Test-side handle to a [`SimulatedRecorder`] owned by a client
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    shared: Arc<Shared>,
}

impl SimulatorHandle {
    /// Drop the link as if the recorder went out of range
    pub fn drop_link(&self, reason: &str) {
        info!("Simulated recorder dropping link: {}", reason);
        self.shared.link_dropped.store(true, Ordering::SeqCst);
        self.shared.emit(TransportEvent::Disconnected {
            reason: Some(reason.to_string()),
        });
        *self.shared.events() = None;
    }

    /// Acknowledgments received for FILE_TRANSFER replies
    pub fn acks_received(&self) -> usize {
        self.shared.acks.load(Ordering::SeqCst)
    }

    /// Commands received, excluding acknowledgments
    pub fn commands_received(&self) -> usize {
        self.shared.commands.load(Ordering::SeqCst)
    }
}

/// In-process recorder implementing [`Transport`]
#[derive(Debug)]
pub struct SimulatedRecorder {
    config: SimulatorConfig,
    shared: Arc<Shared>,
    rx_buffer: Vec<u8>,
    sequence: u8,
    connected: bool,
}

impl SimulatedRecorder {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            rx_buffer: Vec::new(),
            sequence: 0,
            connected: false,
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            shared: self.shared.clone(),
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        let is_ack = packet.is_file_transfer()
            && packet.payload().is_empty()
            && packet.command() & 0x80 != 0;
        if is_ack {
            self.shared.acks.fetch_add(1, Ordering::SeqCst);
            return;
        }

        self.shared.commands.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated recorder received {:?}", packet);

        match (packet.channel(), packet.command()) {
            (channel::CONTROL, command::GET_BATTERY) => {
                let battery = [self.config.battery_percent];
                self.reply(Endpoint::Status, channel::CONTROL, command::BATTERY_REPLY, &battery);
            }
            (channel::CONTROL, command::GET_CAPACITY) => {
                let mut capacity = self.config.used_kib.to_be_bytes().to_vec();
                capacity.extend(self.config.total_kib.to_be_bytes());
                self.reply(Endpoint::Status, channel::CONTROL, command::CAPACITY_REPLY, &capacity);
            }
            (channel::CONTROL, command::GET_VERSION) => {
                let version = self.config.firmware_version.clone().into_bytes();
                self.reply(Endpoint::Data, channel::CONTROL, command::VERSION_REPLY, &version);
            }
            (channel::FILE_TRANSFER, command::LIST_REQUEST) => self.send_listing(),
            (channel::FILE_TRANSFER, command::IMPORT_REQUEST) => {
                let end = packet
                    .payload()
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(packet.payload().len());
                let name = packet.payload()[..end].to_vec();
                self.send_file(&name);
            }
            (channel, command) => {
                debug!(
                    "Simulated recorder ignoring command {:#04x} on channel {:#04x}",
                    command, channel
                );
            }
        }
    }

    fn send_listing(&mut self) {
        let records: Vec<u8> = self
            .config
            .files
            .iter()
            .flat_map(|f| encode_record(f.field, f.size_bytes(), &f.raw_name))
            .collect();

        let chunk_size = self.config.list_chunk_size.max(1);
        for chunk in records.chunks(chunk_size) {
            self.reply(Endpoint::Data, channel::FILE_TRANSFER, command::LIST_REPLY, chunk);
        }
        if self.config.send_list_complete {
            self.reply(Endpoint::Data, channel::FILE_TRANSFER, command::LIST_COMPLETE, &[]);
        }
    }

    fn send_file(&mut self, raw_name: &[u8]) {
        let Some(file) = self
            .config
            .files
            .iter()
            .find(|f| f.raw_name == raw_name)
            .cloned()
        else {
            debug!(
                "Simulated recorder has no file named {}",
                String::from_utf8_lossy(raw_name)
            );
            self.reply(
                Endpoint::Data,
                channel::FILE_TRANSFER,
                command::IMPORT_COMPLETE,
                &[STATUS_NOT_FOUND],
            );
            return;
        };

        self.reply(Endpoint::Data, channel::FILE_TRANSFER, command::IMPORT_STARTED, &[]);

        let len = file.content.len();
        let sent = self.config.stall_after.map_or(len, |limit| limit.min(len));
        let chunk_size = self.config.data_chunk_size.max(1);
        for chunk in file.content[..sent].chunks(chunk_size) {
            self.reply(Endpoint::Data, channel::FILE_TRANSFER, command::FILE_DATA, chunk);
        }

        if self.config.stall_after.is_none() {
            let status = [self.config.import_status];
            self.reply(Endpoint::Data, channel::FILE_TRANSFER, command::IMPORT_COMPLETE, &status);
        }
    }

    /// Emit one reply frame as a series of notification fragments
    fn reply(&mut self, endpoint: Endpoint, channel: u8, command: u8, payload: &[u8]) {
        let frame = packet::encode(self.sequence, channel, command, payload);
        self.sequence = self.sequence.wrapping_add(1);

        let fragment_size = self.config.fragment_size.max(1);
        for fragment in frame.chunks(fragment_size) {
            self.shared.emit(TransportEvent::Notification {
                endpoint,
                bytes: fragment.to_vec(),
            });
        }
    }
}

#[async_trait]
impl Transport for SimulatedRecorder {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_write_size: self.config.max_write_size,
        }
    }

    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        if self.config.unreachable {
            return Err(ProtocolError::DeviceNotFound(
                "simulated recorder is out of range".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.events() = Some(tx);
        self.shared.link_dropped.store(false, Ordering::SeqCst);
        self.rx_buffer.clear();
        self.sequence = 0;
        self.connected = true;

        info!(
            "Simulated recorder connected ({} files)",
            self.config.files.len()
        );
        Ok(rx)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::Transport(
                "simulated recorder not connected".to_string(),
            ));
        }
        if bytes.len() > self.config.max_write_size {
            return Err(ProtocolError::Transport(format!(
                "write of {} bytes exceeds {}",
                bytes.len(),
                self.config.max_write_size
            )));
        }

        self.rx_buffer.extend_from_slice(bytes);
        loop {
            match packet::try_decode(&self.rx_buffer) {
                Decoded::Packet { packet, consumed } => {
                    self.rx_buffer.drain(..consumed);
                    self.handle_packet(packet);
                }
                Decoded::Incomplete => break,
                Decoded::Desynced {
                    resync_at: Some(offset),
                } => {
                    self.rx_buffer.drain(..offset);
                }
                Decoded::Desynced { resync_at: None } => {
                    self.rx_buffer.clear();
                    break;
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        *self.shared.events() = None;
        info!("Simulated recorder disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.shared.link_dropped.load(Ordering::SeqCst)
    }
}
