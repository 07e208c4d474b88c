//! Subcommand Implementations
//!
//! Each command connects through a [`RecorderClient`], does its work and
//! leaves disconnecting to the caller.

use crate::config::Config;
use crate::diagnostics::{format_duration, format_size, format_storage, format_transfer};
use anyhow::{bail, Context, Result};
use recsync_protocol::{
    ConnectionState, DeviceFileEntry, DeviceStatus, DownloadedFile, RecorderClient, Transport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// How long to wait for the three status replies after connecting
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between status refreshes in watch mode
const WATCH_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the transport selected by the command line
pub fn build_transport(config: &Config, simulate: bool) -> Result<Box<dyn Transport>> {
    if simulate {
        info!("Using simulated recorder");
        let recorder =
            recsync_protocol::SimulatedRecorder::new(recsync_protocol::SimulatorConfig {
                max_write_size: config.sync.max_write_size,
                ..Default::default()
            });
        return Ok(Box::new(recorder));
    }

    #[cfg(feature = "bluetooth")]
    {
        Ok(Box::new(recsync_protocol::BluetoothTransport::new(
            config.bluetooth_config(),
        )))
    }

    #[cfg(not(feature = "bluetooth"))]
    {
        bail!("built without the `bluetooth` feature; use --simulate or rebuild with --features bluetooth")
    }
}

/// Connect and wait for the status snapshot to fill in
async fn connected_status(client: &RecorderClient) -> Result<DeviceStatus> {
    let mut updates = client.subscribe_status().await?;
    client.connect().await.context("Failed to connect to recorder")?;

    let deadline = Instant::now() + STATUS_TIMEOUT;
    let mut latest = DeviceStatus::default();
    while !is_complete(&latest) {
        match tokio::time::timeout_at(deadline, updates.recv()).await {
            Ok(Some(status)) => latest = status,
            Ok(None) => break,
            Err(_) => {
                warn!("Recorder did not answer every status request");
                break;
            }
        }
    }
    Ok(latest)
}

fn is_complete(status: &DeviceStatus) -> bool {
    status.battery_percent.is_some()
        && status.storage.is_some()
        && status.firmware_version.is_some()
}

fn print_status(status: &DeviceStatus) {
    match status.battery_percent {
        Some(percent) => println!("Battery:  {}%", percent),
        None => println!("Battery:  unknown"),
    }
    match status.storage {
        Some(storage) => println!("Storage:  {}", format_storage(&storage)),
        None => println!("Storage:  unknown"),
    }
    println!(
        "Firmware: {}",
        status.firmware_version.as_deref().unwrap_or("unknown")
    );
}

/// `recsync status`
pub async fn status(client: &RecorderClient) -> Result<()> {
    let status = connected_status(client).await?;
    print_status(&status);
    Ok(())
}

/// `recsync list`
pub async fn list(client: &RecorderClient, json: bool) -> Result<()> {
    client.connect().await.context("Failed to connect to recorder")?;
    let files = client.request_file_list().await?.finish().await?;
    info!("Recorder holds {} recordings", files.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    for file in &files {
        let captured = file
            .capture_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:>10} {:>8}  {}",
            file.display_name(),
            format_size(u64::from(file.size_bytes())),
            format_duration(file.duration_seconds()),
            captured
        );
    }
    Ok(())
}

fn find_entry<'a>(files: &'a [DeviceFileEntry], name: &str) -> Option<&'a DeviceFileEntry> {
    files
        .iter()
        .find(|f| f.display_name() == name)
        .or_else(|| files.iter().find(|f| f.display_name().eq_ignore_ascii_case(name)))
}

/// `recsync download`
pub async fn download(client: &RecorderClient, name: &str, output_dir: &Path) -> Result<PathBuf> {
    client.connect().await.context("Failed to connect to recorder")?;
    let files = client.request_file_list().await?.finish().await?;

    let Some(entry) = find_entry(&files, name) else {
        bail!("no recording named '{}' on the recorder", name);
    };

    info!(
        "Downloading {} ({})",
        entry.display_name(),
        format_size(u64::from(entry.size_bytes()))
    );
    let mut reported = 0;
    let file = client
        .request_download(entry.clone())
        .await?
        .finish_with_progress(|progress| {
            // One line per 10%
            if progress.percent >= reported + 10 || progress.percent == 100 {
                reported = progress.percent;
                info!("{}", format_transfer(&progress));
            }
        })
        .await
        .with_context(|| format!("Failed to download {}", name))?;

    let path = save_download(&file, output_dir).await?;
    println!("{}", path.display());
    Ok(path)
}

/// Write a finished download into `output_dir`
pub async fn save_download(file: &DownloadedFile, output_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let path = output_dir.join(sanitize_file_name(file.name()));
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    if file.header_synthesized {
        debug!("Added WAV header to {}", path.display());
    }
    info!(
        "Saved {} ({}, {})",
        path.display(),
        file.mime_type,
        format_size(file.data.len() as u64)
    );
    Ok(path)
}

/// Turn a device-supplied name into a safe single path component
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "recording".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `recsync watch`
pub async fn watch(client: &RecorderClient) -> Result<()> {
    let mut states = client.subscribe_state().await?;
    let mut statuses = client.subscribe_status().await?;

    client.connect().await.context("Failed to connect to recorder")?;
    println!("Watching recorder, press Ctrl-C to stop");

    let mut refresh = tokio::time::interval(WATCH_REFRESH_INTERVAL);
    refresh.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            Some(state) = states.recv() => {
                println!("State: {}", state);
                if state == ConnectionState::Disconnected {
                    warn!("Link lost; reconnecting");
                    match timeout(RECONNECT_TIMEOUT, client.connect()).await {
                        Ok(Ok(())) => info!("Reconnected"),
                        Ok(Err(e)) => warn!("Reconnect failed: {}", e),
                        Err(_) => warn!("Reconnect timed out"),
                    }
                }
            }
            Some(status) = statuses.recv() => {
                if is_complete(&status) {
                    print_status(&status);
                }
            }
            _ = refresh.tick() => {
                if let Err(e) = client.refresh_status().await {
                    debug!("Status refresh skipped: {}", e);
                }
            }
        }
    }
}

/// `recsync dump-config`
pub fn dump_config(config: &Config) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{}", contents);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsync_protocol::{EngineConfig, SimulatedRecorder, SimulatorConfig};
    use tempfile::TempDir;

    fn client() -> RecorderClient {
        RecorderClient::spawn(
            Box::new(SimulatedRecorder::new(SimulatorConfig::default())),
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("REC001.WAV"), "REC001.WAV");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a:b*c?.wav"), "a_b_c_.wav");
        assert_eq!(sanitize_file_name("..."), "recording");
        assert_eq!(sanitize_file_name("  "), "recording");
    }

    #[test]
    fn test_find_entry_prefers_exact_match() {
        let files = vec![
            DeviceFileEntry::new("rec1.wav", b"rec1.wav".to_vec(), 10, 0, 0),
            DeviceFileEntry::new("REC1.WAV", b"REC1.WAV".to_vec(), 20, 0, 0),
        ];
        assert_eq!(find_entry(&files, "REC1.WAV").unwrap().size_bytes(), 20);
        assert_eq!(find_entry(&files, "Rec1.Wav").unwrap().size_bytes(), 10);
        assert!(find_entry(&files, "missing.wav").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_against_simulator() {
        let client = client();
        let status = connected_status(&client).await.unwrap();
        assert!(is_complete(&status));
        assert_eq!(status.battery_percent, Some(76));
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_writes_file() {
        let dir = TempDir::new().unwrap();
        let client = client();

        let path = download(&client, "memo.mp3", dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("memo.mp3"));
        assert_eq!(std::fs::read(&path).unwrap().len(), 2_000);
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_unknown_name_fails() {
        let dir = TempDir::new().unwrap();
        let client = client();

        assert!(download(&client, "nope.wav", dir.path()).await.is_err());
        client.shutdown().await.unwrap();
    }
}
