//! File List Reassembler
//!
//! Rebuilds the recorder's directory listing from a chunked stream of fixed
//! 28-byte records:
//!
//! ```text
//! [timestampOrDuration:4 BE][sizeBytes:4 BE][name:20, NUL-terminated]
//! ```
//!
//! Chunk boundaries do not line up with record boundaries, so leftover bytes
//! are kept in a scratch buffer until the next chunk completes the record.
//!
//! ## Timestamp field
//!
//! The first field means different things depending on firmware:
//! - a capture time, when it is a plausible epoch (after 2000-01-01)
//! - a duration in seconds, when it is shorter than one week
//!
//! A `YYYYMMDD-HHMMSS` pattern in the filename always wins over the field.
//!
//! ## Finalization
//!
//! The listing ends on an explicit LIST_COMPLETE or after a quiet period
//! without data, whichever comes first. The second trigger is a no-op.

use crate::timer::Deadline;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Size of one directory record
pub const ENTRY_LEN: usize = 28;

/// Width of the NUL-terminated name field
pub const NAME_FIELD_LEN: usize = 20;

/// Epoch values at or below this (2000-01-01T00:00:00Z) are not capture times
pub const SANITY_EPOCH: u32 = 946_684_800;

/// Field values below this (one week) may be durations
pub const MAX_DURATION_SECS: u32 = 7 * 24 * 60 * 60;

/// Default quiet period before an unterminated listing is considered complete
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1500);

/// One recording stored on the recorder
///
/// Identity for de-duplication is `(display_name, size_bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFileEntry {
    display_name: String,
    #[serde(serialize_with = "serialize_hex")]
    raw_name: Vec<u8>,
    size_bytes: u32,
    capture_epoch_seconds: u32,
    duration_seconds: u32,
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl DeviceFileEntry {
    /// Build an entry from already-decoded parts
    ///
    /// `raw_name` is truncated to [`NAME_FIELD_LEN`] bytes.
    pub fn new(
        display_name: impl Into<String>,
        raw_name: impl Into<Vec<u8>>,
        size_bytes: u32,
        capture_epoch_seconds: u32,
        duration_seconds: u32,
    ) -> Self {
        let mut raw_name = raw_name.into();
        raw_name.truncate(NAME_FIELD_LEN);
        Self {
            display_name: display_name.into(),
            raw_name,
            size_bytes,
            capture_epoch_seconds,
            duration_seconds,
        }
    }

    /// Decode one directory record
    ///
    /// Returns `None` for all-zero padding records. `now_epoch` is used as the
    /// capture time when neither the name nor the field carry one.
    pub fn from_record(record: &[u8; ENTRY_LEN], now_epoch: u32) -> Option<Self> {
        if record.iter().all(|&b| b == 0) {
            return None;
        }

        let field = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let size_bytes = u32::from_be_bytes([record[4], record[5], record[6], record[7]]);

        let name_field = &record[8..ENTRY_LEN];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD_LEN);
        let raw_name = name_field[..name_len].to_vec();
        let display_name = decode_name(&raw_name, size_bytes);

        let (capture_epoch_seconds, duration_seconds) =
            match capture_time_from_name(&display_name) {
                Some(captured) => {
                    let duration = if field < MAX_DURATION_SECS { field } else { 0 };
                    (captured, duration)
                }
                None if field > SANITY_EPOCH => (field, 0),
                None if field < MAX_DURATION_SECS => (now_epoch, field),
                None => (now_epoch, 0),
            };

        Some(Self {
            display_name,
            raw_name,
            size_bytes,
            capture_epoch_seconds,
            duration_seconds,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Name bytes exactly as stored on the recorder, without the terminator
    pub fn raw_name(&self) -> &[u8] {
        &self.raw_name
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn capture_epoch_seconds(&self) -> u32 {
        self.capture_epoch_seconds
    }

    pub fn duration_seconds(&self) -> u32 {
        self.duration_seconds
    }

    pub fn capture_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.capture_epoch_seconds), 0)
    }

    fn identity(&self) -> (String, u32) {
        (self.display_name.clone(), self.size_bytes)
    }
}

/// Decode a device-side filename
///
/// Tries GBK, then UTF-8, then falls back to a placeholder. Never fails.
pub fn decode_name(raw: &[u8], size_bytes: u32) -> String {
    if !raw.is_empty() {
        if let Some(name) = encoding_rs::GBK.decode_without_bom_handling_and_without_replacement(raw)
        {
            if is_printable(&name) {
                return name.into_owned();
            }
        }

        if let Ok(name) = std::str::from_utf8(raw) {
            if is_printable(name) {
                return name.to_string();
            }
        }

        let placeholder = format!("file_{}", hex::encode(raw));
        debug!("Undecodable filename {:02x?}, using {}", raw, placeholder);
        return placeholder;
    }

    format!("file_{}", size_bytes)
}

fn is_printable(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_control)
}

fn filename_timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{4})(\d{2})(\d{2})[-_ ]?(\d{2})(\d{2})(\d{2})")
            .expect("filename timestamp pattern is valid")
    })
}

/// Extract a capture time from a `YYYYMMDD-HHMMSS` pattern in a filename (UTC)
///
/// The first match that forms a valid date wins.
pub fn capture_time_from_name(name: &str) -> Option<u32> {
    filename_timestamp_pattern()
        .captures_iter(name)
        .find_map(|caps| timestamp_from_captures(&caps))
}

fn timestamp_from_captures(caps: &regex::Captures<'_>) -> Option<u32> {
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = i32::try_from(num(1)?).ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;
    let timestamp = date
        .and_hms_opt(num(4)?, num(5)?, num(6)?)?
        .and_utc()
        .timestamp();

    u32::try_from(timestamp).ok()
}

fn current_epoch() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

/// Accumulates directory records for one listing request
#[derive(Debug)]
pub struct FileListReassembler {
    quiet_period: Duration,
    active: bool,
    scratch: Vec<u8>,
    entries: Vec<DeviceFileEntry>,
    seen: HashSet<(String, u32)>,
    quiet_timer: Deadline,
}

impl FileListReassembler {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            active: false,
            scratch: Vec::new(),
            entries: Vec::new(),
            seen: HashSet::new(),
            quiet_timer: Deadline::new(),
        }
    }

    /// Start a new listing: clear previous results and arm the quiet timer
    pub fn begin(&mut self, now: Instant) {
        self.entries.clear();
        self.seen.clear();
        self.scratch.clear();
        self.active = true;
        self.quiet_timer.arm(now, self.quiet_period);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Entries collected so far in the current (or last) listing
    pub fn entries(&self) -> &[DeviceFileEntry] {
        &self.entries
    }

    /// When the quiet period ends, if a listing is active
    pub fn deadline(&self) -> Option<Instant> {
        self.quiet_timer.when()
    }

    /// Feed a chunk of directory data
    ///
    /// `on_partial` is called with the running list after every new entry.
    /// Returns the number of entries added.
    pub fn on_chunk<F>(&mut self, chunk: &[u8], now: Instant, mut on_partial: F) -> usize
    where
        F: FnMut(&[DeviceFileEntry]),
    {
        if !self.active {
            debug!("Dropping {} bytes of list data, no listing active", chunk.len());
            return 0;
        }

        self.scratch.extend_from_slice(chunk);
        self.quiet_timer.arm(now, self.quiet_period);

        let now_epoch = current_epoch();
        let mut added = 0;
        let mut consumed = 0;

        while self.scratch.len() - consumed >= ENTRY_LEN {
            let mut record = [0u8; ENTRY_LEN];
            record.copy_from_slice(&self.scratch[consumed..consumed + ENTRY_LEN]);
            consumed += ENTRY_LEN;

            let Some(entry) = DeviceFileEntry::from_record(&record, now_epoch) else {
                trace!("Skipping padding record");
                continue;
            };

            if !self.seen.insert(entry.identity()) {
                debug!(
                    "Duplicate entry {} ({} bytes) ignored",
                    entry.display_name, entry.size_bytes
                );
                continue;
            }

            trace!(
                "Listed {} ({} bytes, captured {})",
                entry.display_name,
                entry.size_bytes,
                entry.capture_epoch_seconds
            );
            self.entries.push(entry);
            added += 1;
            self.quiet_timer.arm(now, self.quiet_period);
            on_partial(&self.entries);
        }

        self.scratch.drain(..consumed);
        added
    }

    /// Finalize the listing
    ///
    /// Returns the final list the first time it is called for a listing and
    /// `None` afterwards, so both finalization triggers can call it safely.
    pub fn finish(&mut self) -> Option<Vec<DeviceFileEntry>> {
        if !self.active {
            return None;
        }

        self.active = false;
        self.quiet_timer.disarm();
        if !self.scratch.is_empty() {
            warn!(
                "Listing ended with {} bytes of incomplete record, discarding",
                self.scratch.len()
            );
            self.scratch.clear();
        }

        Some(self.entries.clone())
    }

    /// Finalize if the quiet period elapsed
    pub fn poll_quiet_period(&mut self, now: Instant) -> Option<Vec<DeviceFileEntry>> {
        if self.quiet_timer.fire_if_due(now) {
            debug!("List quiet period elapsed, finalizing");
            return self.finish();
        }
        None
    }

    /// Abandon the listing without producing a result
    pub fn abort(&mut self) {
        self.active = false;
        self.quiet_timer.disarm();
        self.scratch.clear();
    }
}

impl Default for FileListReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

/// Encode a directory record, the inverse of [`DeviceFileEntry::from_record`]
///
/// Used by the simulated recorder and tests.
pub fn encode_record(field: u32, size_bytes: u32, raw_name: &[u8]) -> [u8; ENTRY_LEN] {
    let mut record = [0u8; ENTRY_LEN];
    record[0..4].copy_from_slice(&field.to_be_bytes());
    record[4..8].copy_from_slice(&size_bytes.to_be_bytes());
    let len = raw_name.len().min(NAME_FIELD_LEN);
    record[8..8 + len].copy_from_slice(&raw_name[..len]);
    record
}
