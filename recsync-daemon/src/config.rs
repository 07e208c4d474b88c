//! Daemon Configuration
//!
//! Configuration management for the recsync tool. Stored as TOML under the
//! user's config directory and created with defaults on first run.

use anyhow::{bail, Context, Result};
use recsync_protocol::download::DEFAULT_WATCHDOG_WINDOW;
use recsync_protocol::file_list::DEFAULT_QUIET_PERIOD;
use recsync_protocol::transport::{
    DEFAULT_MAX_WRITE_SIZE, RECORDER_DATA_CHAR_UUID, RECORDER_SERVICE_UUID,
    RECORDER_STATUS_CHAR_UUID, RECORDER_WRITE_CHAR_UUID,
};
use recsync_protocol::{AudioFormat, EngineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Which recorder to connect to
    #[serde(default)]
    pub device: DeviceConfig,

    /// GATT service layout
    #[serde(default)]
    pub gatt: GattConfig,

    /// Protocol timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// PCM layout of headerless recordings
    #[serde(default)]
    pub audio: AudioConfig,

    /// Storage paths
    #[serde(default)]
    pub paths: PathConfig,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bluetooth address; when unset the first device matching
    /// `name_prefix` is used
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// How long to scan before giving up
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

/// GATT UUIDs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GattConfig {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    #[serde(default = "default_write_uuid")]
    pub write_uuid: Uuid,

    #[serde(default = "default_data_uuid")]
    pub data_uuid: Uuid,

    #[serde(default = "default_status_uuid")]
    pub status_uuid: Uuid,
}

/// Protocol timing and link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Silence after the last listing chunk before the listing is final
    #[serde(default = "default_quiet_period")]
    pub quiet_period_ms: u64,

    /// Longest gap between file chunks before a download is failed
    #[serde(default = "default_watchdog")]
    pub watchdog_secs: u64,

    /// Largest single GATT write
    #[serde(default = "default_max_write_size")]
    pub max_write_size: usize,
}

/// Audio format used to repair headerless WAV recordings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Where downloaded recordings are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_name_prefix() -> String {
    "REC".to_string()
}

fn default_scan_timeout() -> u64 {
    15
}

fn default_service_uuid() -> Uuid {
    RECORDER_SERVICE_UUID
}

fn default_write_uuid() -> Uuid {
    RECORDER_WRITE_CHAR_UUID
}

fn default_data_uuid() -> Uuid {
    RECORDER_DATA_CHAR_UUID
}

fn default_status_uuid() -> Uuid {
    RECORDER_STATUS_CHAR_UUID
}

fn default_quiet_period() -> u64 {
    DEFAULT_QUIET_PERIOD.as_millis() as u64
}

fn default_watchdog() -> u64 {
    DEFAULT_WATCHDOG_WINDOW.as_secs()
}

fn default_max_write_size() -> usize {
    DEFAULT_MAX_WRITE_SIZE
}

fn default_sample_rate() -> u32 {
    AudioFormat::default().sample_rate
}

fn default_channels() -> u16 {
    AudioFormat::default().channels
}

fn default_bits_per_sample() -> u16 {
    AudioFormat::default().bits_per_sample
}

fn default_download_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recsync")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_prefix: default_name_prefix(),
            scan_timeout_secs: default_scan_timeout(),
        }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            write_uuid: default_write_uuid(),
            data_uuid: default_data_uuid(),
            status_uuid: default_status_uuid(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period(),
            watchdog_secs: default_watchdog(),
            max_write_size: default_max_write_size(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits_per_sample: default_bits_per_sample(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// `<config_dir>/recsync/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("recsync")
            .join("config.toml")
    }

    /// Load configuration from file, creating default if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!("Created default config at {}", path.display());
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_write_size == 0 {
            bail!("sync.max_write_size must be at least 1");
        }
        if self.sync.quiet_period_ms == 0 {
            bail!("sync.quiet_period_ms must be greater than zero");
        }
        if self.sync.watchdog_secs == 0 {
            bail!("sync.watchdog_secs must be greater than zero");
        }
        if self.audio.channels == 0 || self.audio.sample_rate == 0 {
            bail!("audio.channels and audio.sample_rate must be greater than zero");
        }
        if self.audio.bits_per_sample == 0 || self.audio.bits_per_sample % 8 != 0 {
            bail!(
                "audio.bits_per_sample must be a positive multiple of 8, got {}",
                self.audio.bits_per_sample
            );
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bits_per_sample: self.audio.bits_per_sample,
        }
    }

    /// Engine timing and audio settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            quiet_period: Duration::from_millis(self.sync.quiet_period_ms),
            watchdog_window: Duration::from_secs(self.sync.watchdog_secs),
            audio_format: self.audio_format(),
        }
    }

    /// BLE transport settings
    #[cfg(feature = "bluetooth")]
    pub fn bluetooth_config(&self) -> recsync_protocol::BluetoothConfig {
        recsync_protocol::BluetoothConfig {
            address: self.device.address.clone(),
            name_prefix: self.device.name_prefix.clone(),
            scan_timeout: Duration::from_secs(self.device.scan_timeout_secs),
            service_uuid: self.gatt.service_uuid,
            write_uuid: self.gatt.write_uuid,
            data_uuid: self.gatt.data_uuid,
            status_uuid: self.gatt.status_uuid,
            max_write_size: self.sync.max_write_size,
        }
    }
}
