//! Device Status
//!
//! Battery, storage and firmware information reported on the CONTROL
//! channel. The snapshot is filled in field by field as replies arrive and
//! is only reset when the link goes down.
//!
//! ## Reply Formats
//!
//! - `BATTERY_REPLY`: `[percent:u8]`
//! - `CAPACITY_REPLY`: `[usedKiB:4 BE][totalKiB:4 BE]`
//! - `VERSION_REPLY`: NUL-padded text, or `[major, minor, patch, build]`

use crate::packet::command;
use serde::Serialize;
use tracing::{debug, warn};

/// Storage usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCapacity {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl StorageCapacity {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Partially populated recorder status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub battery_percent: Option<u8>,
    pub storage: Option<StorageCapacity>,
    pub firmware_version: Option<String>,
}

impl DeviceStatus {
    /// Apply one CONTROL reply
    ///
    /// Returns `true` if a field was updated.
    pub fn apply_reply(&mut self, command: u8, payload: &[u8]) -> bool {
        match command {
            command::BATTERY_REPLY => match payload.first() {
                Some(&percent) => {
                    self.battery_percent = Some(percent.min(100));
                    true
                }
                None => {
                    warn!("Empty battery reply");
                    false
                }
            },
            command::CAPACITY_REPLY => match parse_capacity(payload) {
                Some(storage) => {
                    self.storage = Some(storage);
                    true
                }
                None => {
                    warn!("Malformed capacity reply ({} bytes)", payload.len());
                    false
                }
            },
            command::VERSION_REPLY => match parse_version(payload) {
                Some(version) => {
                    self.firmware_version = Some(version);
                    true
                }
                None => {
                    warn!("Empty firmware version reply");
                    false
                }
            },
            other => {
                debug!("Ignoring control command {:#04x}", other);
                false
            }
        }
    }
}

fn parse_capacity(payload: &[u8]) -> Option<StorageCapacity> {
    if payload.len() < 8 {
        return None;
    }
    let used_kib = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let total_kib = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

    Some(StorageCapacity {
        used_bytes: u64::from(used_kib) * 1024,
        total_bytes: u64::from(total_kib) * 1024,
    })
}

fn parse_version(payload: &[u8]) -> Option<String> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    let text = &payload[..end];

    if !text.is_empty() && text.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Some(String::from_utf8_lossy(text).trim().to_string());
    }

    if payload.len() == 4 {
        return Some(format!(
            "{}.{}.{}.{}",
            payload[0], payload[1], payload[2], payload[3]
        ));
    }

    if text.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(text).into_owned())
    }
}
