//! File Download Reassembler
//!
//! Tracks the single in-flight file import: collects content chunks, reports
//! progress, repairs headerless WAV payloads on completion, and fails the
//! session on a device error status or when the watchdog expires.

use crate::file_list::{DeviceFileEntry, NAME_FIELD_LEN};
use crate::timer::Watchdog;
use crate::wav::{self, AudioFormat};
use crate::{ProtocolError, Result};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default watchdog window for file transfers
pub const DEFAULT_WATCHDOG_WINDOW: Duration = Duration::from_secs(10);

/// MIME type used for unknown extensions and repaired recordings
pub const DEFAULT_MIME_TYPE: &str = "audio/wav";

/// Infer a MIME type from a recording's file extension
///
/// # Examples
///
/// ```
/// use recsync_protocol::download::mime_type_for;
///
/// assert_eq!(mime_type_for("memo.MP3"), "audio/mpeg");
/// assert_eq!(mime_type_for("20240102-153000.hda"), "audio/wav");
/// assert_eq!(mime_type_for("no_extension"), "audio/wav");
/// ```
pub fn mime_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("ogg") | Some("opus") => "audio/ogg",
        // wav, hda and anything unrecognized
        _ => DEFAULT_MIME_TYPE,
    }
}

/// IMPORT_REQUEST payload: the raw device name right-padded with NULs
pub fn import_request_payload(raw_name: &[u8]) -> [u8; NAME_FIELD_LEN] {
    let mut field = [0u8; NAME_FIELD_LEN];
    let len = raw_name.len().min(NAME_FIELD_LEN);
    field[..len].copy_from_slice(&raw_name[..len]);
    field
}

/// Progress of the active download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// `round(100 * received / total)`, clamped to 0..=100; always 100
    /// for a zero-length file
    pub percent: u8,
    pub received: u32,
    pub total: u32,
}

impl Progress {
    pub(crate) fn new(received: u32, total: u32) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (f64::from(received) * 100.0 / f64::from(total))
                .round()
                .clamp(0.0, 100.0) as u8
        };
        Self {
            percent,
            received,
            total,
        }
    }
}

/// A completed recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub entry: DeviceFileEntry,
    pub mime_type: &'static str,
    pub data: Vec<u8>,
    /// True when a WAV header was synthesized in front of raw samples
    pub header_synthesized: bool,
}

impl DownloadedFile {
    pub fn name(&self) -> &str {
        self.entry.display_name()
    }
}

/// State of the one in-flight download
#[derive(Debug)]
pub struct DownloadSession {
    entry: DeviceFileEntry,
    chunks: Vec<Vec<u8>>,
    received_size_bytes: u32,
    started: bool,
}

impl DownloadSession {
    fn new(entry: DeviceFileEntry) -> Self {
        Self {
            entry,
            chunks: Vec::new(),
            received_size_bytes: 0,
            started: false,
        }
    }

    pub fn target_name(&self) -> &str {
        self.entry.display_name()
    }

    pub fn total_size_bytes(&self) -> u32 {
        self.entry.size_bytes()
    }

    pub fn received_size_bytes(&self) -> u32 {
        self.received_size_bytes
    }

    fn progress(&self) -> Progress {
        Progress::new(self.received_size_bytes, self.total_size_bytes())
    }

    fn assemble(self) -> (DeviceFileEntry, Vec<u8>) {
        (self.entry, self.chunks.concat())
    }
}

/// Owns the download session and its watchdog
#[derive(Debug)]
pub struct DownloadReassembler {
    session: Option<DownloadSession>,
    watchdog: Watchdog,
    audio_format: AudioFormat,
}

impl DownloadReassembler {
    pub fn new(watchdog_window: Duration, audio_format: AudioFormat) -> Self {
        Self {
            session: None,
            watchdog: Watchdog::new(watchdog_window),
            audio_format,
        }
    }

    /// Start a download and return the IMPORT_REQUEST payload
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidState` if a download is already active.
    pub fn begin(&mut self, entry: DeviceFileEntry, now: Instant) -> Result<[u8; NAME_FIELD_LEN]> {
        if let Some(session) = &self.session {
            return Err(ProtocolError::invalid_state(format!(
                "download of {} already in progress",
                session.target_name()
            )));
        }

        let payload = import_request_payload(entry.raw_name());
        info!(
            "Starting download of {} ({} bytes)",
            entry.display_name(),
            entry.size_bytes()
        );
        self.session = Some(DownloadSession::new(entry));
        self.watchdog.arm(now);
        Ok(payload)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&DownloadSession> {
        self.session.as_ref()
    }

    /// When the watchdog fires, if a download is active
    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.when()
    }

    /// The recorder acknowledged the import request
    pub fn on_started(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            debug!("Recorder started sending {}", session.target_name());
            session.started = true;
            self.watchdog.feed(now);
        }
    }

    /// Append a content chunk and return the new progress
    pub fn on_chunk(&mut self, chunk: &[u8], now: Instant) -> Option<Progress> {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {} bytes of file data, no download active", chunk.len());
            return None;
        };

        let before = session.received_size_bytes;
        let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        session.received_size_bytes = before.saturating_add(len);
        session.chunks.push(chunk.to_vec());
        self.watchdog.feed(now);

        let total = session.total_size_bytes();
        if before <= total && session.received_size_bytes > total {
            warn!(
                "{}: received {} bytes but the listing declared {}, payload may be corrupt",
                session.target_name(),
                session.received_size_bytes,
                total
            );
        }

        Some(session.progress())
    }

    /// Handle IMPORT_COMPLETE
    ///
    /// Returns `None` when no download is active, otherwise the finished file
    /// or the device error. The session is cleared either way.
    pub fn complete(&mut self, status: u8) -> Option<Result<DownloadedFile>> {
        let session = self.session.take()?;
        self.watchdog.disarm();

        if status != 0 {
            warn!(
                "Recorder failed download of {} with status {}",
                session.target_name(),
                status
            );
            return Some(Err(ProtocolError::Device { status }));
        }

        if !session.started {
            debug!("{} completed without an IMPORT_STARTED", session.target_name());
        }
        if session.received_size_bytes != session.total_size_bytes() {
            warn!(
                "{}: received {} of {} declared bytes",
                session.target_name(),
                session.received_size_bytes,
                session.total_size_bytes()
            );
        }

        let (entry, data) = session.assemble();
        let mime_type = mime_type_for(entry.display_name());
        let (data, header_synthesized) = if mime_type == DEFAULT_MIME_TYPE {
            wav::ensure_header(data, self.audio_format)
        } else {
            (data, false)
        };

        if header_synthesized {
            info!(
                "{} arrived without a WAV header, synthesized one",
                entry.display_name()
            );
        }
        info!(
            "Download of {} complete ({} bytes, {})",
            entry.display_name(),
            data.len(),
            mime_type
        );

        Some(Ok(DownloadedFile {
            entry,
            mime_type,
            data,
            header_synthesized,
        }))
    }

    /// Fail the session if the watchdog window elapsed
    pub fn poll_watchdog(&mut self, now: Instant) -> Option<ProtocolError> {
        if !self.watchdog.expired(now) {
            return None;
        }

        let session = self.session.take()?;
        warn!(
            "Download of {} stalled at {} of {} bytes",
            session.target_name(),
            session.received_size_bytes,
            session.total_size_bytes()
        );
        Some(ProtocolError::Stalled {
            received: session.received_size_bytes,
            total: session.total_size_bytes(),
        })
    }

    /// Discard the session, if any
    pub fn abort(&mut self) -> Option<DownloadSession> {
        self.watchdog.disarm();
        self.session.take()
    }
}

impl Default for DownloadReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHDOG_WINDOW, AudioFormat::default())
    }
}
