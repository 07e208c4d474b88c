//! Sync Engine
//!
//! Owns every piece of protocol state for one recorder link: the two receive
//! buffers, the connection state machine, the device status snapshot and
//! the list/download sessions with their timers.
//!
//! The engine never blocks and never reads the clock. Callers pass `now` to
//! every time-sensitive operation and call [`SyncEngine::poll_timers`] at or
//! after [`SyncEngine::next_deadline`]. Commands are written through a
//! [`FrameWriter`] and never awaited.
//!
//! ## Example
//!
//! ```
//! use recsync_protocol::{ChannelWriter, ConnectionState, EngineConfig, SyncEngine};
//! use std::time::Instant;
//!
//! let (writer, mut outbound) = ChannelWriter::new(20);
//! let mut engine = SyncEngine::new(writer, EngineConfig::default());
//!
//! engine.connect_requested().unwrap();
//! engine.link_established(Instant::now()).unwrap();
//! assert_eq!(engine.state(), ConnectionState::Connected);
//!
//! // Battery, capacity and version queries went out on link up
//! assert!(outbound.try_recv().is_ok());
//! ```

use crate::dispatcher::{self, Route, SessionMode};
use crate::download::{DownloadReassembler, Progress, DEFAULT_WATCHDOG_WINDOW};
use crate::events::{DownloadEvent, ListEvent, Subscribers};
use crate::file_list::{DeviceFileEntry, FileListReassembler, DEFAULT_QUIET_PERIOD};
use crate::packet::{self, channel, command, Packet};
use crate::reassembler::{StreamReassembler, StreamStats};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::status::DeviceStatus;
use crate::timer::earliest;
use crate::transport::{Endpoint, FrameWriter};
use crate::wav::AudioFormat;
use crate::{ProtocolError, Result};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Silence after which a listing is considered complete
    pub quiet_period: Duration,
    /// Longest gap between file chunks before a download is failed
    pub watchdog_window: Duration,
    /// PCM layout assumed when a recording arrives without a WAV header
    pub audio_format: AudioFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
            watchdog_window: DEFAULT_WATCHDOG_WINDOW,
            audio_format: AudioFormat::default(),
        }
    }
}

/// Protocol engine for one recorder link
pub struct SyncEngine<W: FrameWriter> {
    writer: W,
    sequence: u8,
    streams: StreamReassembler,
    state: ConnectionStateMachine,
    status: DeviceStatus,
    status_subscribers: Subscribers<DeviceStatus>,
    file_list: FileListReassembler,
    download: DownloadReassembler,
    list_sink: Option<mpsc::UnboundedSender<ListEvent>>,
    download_sink: Option<mpsc::UnboundedSender<DownloadEvent>>,
    /// Whether the active download reported any progress yet
    download_progressed: bool,
}

impl<W: FrameWriter> SyncEngine<W> {
    pub fn new(writer: W, config: EngineConfig) -> Self {
        Self {
            writer,
            sequence: 0,
            streams: StreamReassembler::new(),
            state: ConnectionStateMachine::new(),
            status: DeviceStatus::default(),
            status_subscribers: Subscribers::new(),
            file_list: FileListReassembler::new(config.quiet_period),
            download: DownloadReassembler::new(config.watchdog_window, config.audio_format),
            list_sink: None,
            download_sink: None,
            download_progressed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// Which session currently owns FILE_TRANSFER traffic
    pub fn mode(&self) -> SessionMode {
        if self.download.is_active() {
            SessionMode::Downloading
        } else if self.file_list.is_active() {
            SessionMode::Listing
        } else {
            SessionMode::Idle
        }
    }

    /// Entries of the current (or last) listing
    pub fn entries(&self) -> &[DeviceFileEntry] {
        self.file_list.entries()
    }

    pub fn stream_stats(&self, endpoint: Endpoint) -> StreamStats {
        self.streams.stats(endpoint)
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Subscribe to connection state changes
    pub fn subscribe_state(&mut self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to device status changes
    pub fn subscribe_status(&mut self) -> mpsc::UnboundedReceiver<DeviceStatus> {
        self.status_subscribers.subscribe(self.status.clone())
    }

    /// Earliest time at which [`SyncEngine::poll_timers`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.file_list.deadline(), self.download.deadline())
    }

    /// The caller started looking for the recorder
    pub fn connect_requested(&mut self) -> Result<()> {
        self.state.connect_requested()
    }

    /// The transport link is up; queries the device status
    pub fn link_established(&mut self, _now: Instant) -> Result<()> {
        self.state.link_established()?;
        self.streams.clear();
        self.sequence = 0;
        self.refresh_status()
    }

    /// The recorder was not found or the search was cancelled
    pub fn link_failed(&mut self) -> Result<()> {
        self.state.search_failed()
    }

    /// Caller-requested disconnect: fail in-flight work and go idle
    pub fn disconnect(&mut self) {
        info!("Disconnecting from recorder");
        self.reset(|| ProtocolError::Cancelled("disconnected by caller".to_string()));
        self.state.disconnect_requested();
    }

    /// Unsolicited link loss: fail in-flight work and mark the link dropped
    pub fn link_lost(&mut self, reason: Option<&str>) {
        let reason = reason.unwrap_or("link dropped").to_string();
        warn!("Recorder link lost: {}", reason);
        self.reset(|| ProtocolError::LinkLost(reason.clone()));
        self.state.link_lost();
    }

    /// Ask the recorder for battery, storage capacity and firmware version
    pub fn refresh_status(&mut self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Syncing => {}
            other => {
                return Err(ProtocolError::invalid_state(format!(
                    "cannot query status while {}",
                    other
                )))
            }
        }

        debug!("Querying recorder status");
        self.send(channel::CONTROL, command::GET_BATTERY, &[]);
        self.send(channel::CONTROL, command::GET_CAPACITY, &[]);
        self.send(channel::CONTROL, command::GET_VERSION, &[]);
        Ok(())
    }

    /// Start listing the recorder's files
    ///
    /// Events for this request are sent to `sink`; the last one is always
    /// [`ListEvent::Complete`] or [`ListEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidState` unless the link is connected
    /// and idle.
    pub fn request_file_list(
        &mut self,
        sink: mpsc::UnboundedSender<ListEvent>,
        now: Instant,
    ) -> Result<()> {
        self.ensure_ready("list files")?;

        self.state.sync_started()?;
        self.file_list.begin(now);
        self.list_sink = Some(sink);

        info!("Requesting file list");
        self.send(channel::FILE_TRANSFER, command::LIST_REQUEST, &[]);
        Ok(())
    }

    /// Start downloading `entry`
    ///
    /// Events for this request are sent to `sink`; progress always precedes
    /// the final [`DownloadEvent::Complete`] or [`DownloadEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidState` unless the link is connected
    /// and idle.
    pub fn request_download(
        &mut self,
        entry: DeviceFileEntry,
        sink: mpsc::UnboundedSender<DownloadEvent>,
        now: Instant,
    ) -> Result<()> {
        self.ensure_ready("download")?;

        let payload = self.download.begin(entry, now)?;
        if let Err(e) = self.state.sync_started() {
            self.download.abort();
            return Err(e);
        }
        self.download_sink = Some(sink);
        self.download_progressed = false;

        self.send(channel::FILE_TRANSFER, command::IMPORT_REQUEST, &payload);
        Ok(())
    }

    /// Feed bytes from a notify endpoint
    pub fn on_notification(&mut self, endpoint: Endpoint, bytes: &[u8], now: Instant) {
        for packet in self.streams.on_fragment(endpoint, bytes) {
            if dispatcher::needs_ack(&packet) {
                self.write_frame(&packet.acknowledgment());
            }
            self.dispatch(packet, now);
        }
    }

    /// Fire any timers that are due
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(entries) = self.file_list.poll_quiet_period(now) {
            self.finish_listing(entries);
        }

        if let Some(error) = self.download.poll_watchdog(now) {
            self.finish_download(DownloadEvent::Failed(error));
        }
    }

    fn ensure_ready(&self, action: &str) -> Result<()> {
        let mode = self.mode();
        if mode != SessionMode::Idle {
            return Err(ProtocolError::invalid_state(format!(
                "cannot {} while {}",
                action, mode
            )));
        }

        match self.state() {
            ConnectionState::Connected => Ok(()),
            other => Err(ProtocolError::invalid_state(format!(
                "cannot {} while {}",
                action, other
            ))),
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) {
        let route = dispatcher::route(&packet, self.mode());
        debug!("{:?} -> {:?}", packet, route);

        match route {
            Route::Status => {
                if self.status.apply_reply(packet.command(), packet.payload()) {
                    self.status_subscribers.broadcast(&self.status);
                }
            }
            Route::ListData => {
                let sink = self.list_sink.as_ref();
                self.file_list.on_chunk(packet.payload(), now, |entries| {
                    if let Some(tx) = sink {
                        let _ = tx.send(ListEvent::Partial(entries.to_vec()));
                    }
                });
            }
            Route::ListComplete => {
                if let Some(entries) = self.file_list.finish() {
                    self.finish_listing(entries);
                }
            }
            Route::ImportStarted => self.download.on_started(now),
            Route::DownloadData => {
                if let Some(progress) = self.download.on_chunk(packet.payload(), now) {
                    self.report_progress(progress);
                }
            }
            Route::ImportComplete { status } => match self.download.complete(status) {
                Some(Ok(file)) => {
                    // An empty file gets no chunks, so nothing reported 100 yet
                    if !self.download_progressed && file.entry.size_bytes() == 0 {
                        self.report_progress(Progress::new(0, 0));
                    }
                    self.finish_download(DownloadEvent::Complete(file))
                }
                Some(Err(error)) => self.finish_download(DownloadEvent::Failed(error)),
                None => debug!("Import complete with no download active"),
            },
            Route::Ignore(reason) => debug!("Ignoring {:?}: {}", packet, reason),
        }
    }

    fn report_progress(&mut self, progress: Progress) {
        self.download_progressed = true;
        if let Some(tx) = &self.download_sink {
            let _ = tx.send(DownloadEvent::Progress(progress));
        }
    }

    fn finish_listing(&mut self, entries: Vec<DeviceFileEntry>) {
        info!("File list complete: {} entries", entries.len());
        if let Some(tx) = self.list_sink.take() {
            let _ = tx.send(ListEvent::Complete(entries));
        }
        self.end_sync();
    }

    fn finish_download(&mut self, event: DownloadEvent) {
        if let Some(tx) = self.download_sink.take() {
            let _ = tx.send(event);
        }
        self.end_sync();
    }

    fn end_sync(&mut self) {
        if let Err(e) = self.state.sync_ended() {
            debug!("Not returning to connected: {}", e);
        }
    }

    /// Clear buffers, timers and sessions, failing whatever was in flight
    fn reset<F>(&mut self, error: F)
    where
        F: Fn() -> ProtocolError,
    {
        self.streams.clear();

        if self.file_list.is_active() {
            self.file_list.abort();
            if let Some(tx) = self.list_sink.take() {
                let _ = tx.send(ListEvent::Failed(error()));
            }
        }
        self.list_sink = None;

        if let Some(session) = self.download.abort() {
            debug!(
                "Abandoning download of {} at {} of {} bytes",
                session.target_name(),
                session.received_size_bytes(),
                session.total_size_bytes()
            );
            if let Some(tx) = self.download_sink.take() {
                let _ = tx.send(DownloadEvent::Failed(error()));
            }
        }
        self.download_sink = None;

        if self.status != DeviceStatus::default() {
            self.status = DeviceStatus::default();
            self.status_subscribers.broadcast(&self.status);
        }
        self.sequence = 0;
    }

    fn send(&mut self, channel: u8, command: u8, payload: &[u8]) {
        let frame = packet::encode(self.sequence, channel, command, payload);
        debug!(
            "Sending command {:#04x} on channel {:#04x} (seq {})",
            command, channel, self.sequence
        );
        self.sequence = self.sequence.wrapping_add(1);
        self.write_frame(&frame);
    }

    /// Write a frame in pieces no larger than the writer accepts
    ///
    /// Failures are logged and not retried.
    fn write_frame(&mut self, frame: &[u8]) {
        let max = self.writer.max_write_size().max(1);
        for piece in frame.chunks(max) {
            if let Err(e) = self.writer.write(piece) {
                warn!("Failed to write {} bytes to recorder: {}", piece.len(), e);
                return;
            }
        }
    }
}

impl<W: FrameWriter> std::fmt::Debug for SyncEngine<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("mode", &self.mode())
            .field("sequence", &self.sequence)
            .field("status", &self.status)
            .finish()
    }
}
