//! Command Line and Logging
//!
//! Command-line interface, logging setup and small formatting helpers for
//! human-readable output.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use recsync_protocol::{Progress, StorageCapacity};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// recsync command-line interface
#[derive(Parser, Debug)]
#[command(name = "recsync")]
#[command(about = "Sync recordings from a BLE voice recorder", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Talk to a built-in simulated recorder instead of real hardware
    #[arg(long)]
    pub simulate: bool,

    /// Configuration file (defaults to <config_dir>/recsync/config.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show battery, storage and firmware version
    Status,

    /// List recordings stored on the recorder
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download one recording by name
    Download {
        /// Display name as shown by `list`
        name: String,

        /// Output directory (defaults to paths.download_dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Stay connected and print state and status changes until Ctrl-C
    Watch,

    /// Print the effective configuration
    DumpConfig,
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `--log-level` when set. Output goes to stderr so
/// `list --json` can be piped.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let level: Level = cli
        .log_level
        .parse()
        .with_context(|| format!("Unknown log level '{}'", cli.log_level))?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("warn,recsync={0},recsync_protocol={0}", level))
            .context("Failed to build log filter")?,
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(level >= Level::DEBUG);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => builder.json().init(),
        (true, false) => builder.without_time().json().init(),
        (false, true) => builder.init(),
        (false, false) => builder.without_time().init(),
    }

    debug!(%level, json = cli.json_logs, "Logging ready");
    Ok(())
}

const KIB: u64 = 1024;
const SIZE_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// Render a byte count with binary units and one decimal
///
/// The recorder reports capacity in KiB, so sizes are shown in IEC units.
/// Values are rounded to the nearest tenth without going through floats.
pub fn format_size(bytes: u64) -> String {
    if bytes < KIB {
        return format!("{} B", bytes);
    }

    let mut unit = 0;
    let mut scale = KIB;
    while unit + 1 < SIZE_UNITS.len() && bytes / scale >= KIB {
        scale *= KIB;
        unit += 1;
    }

    let tenths = (u128::from(bytes) * 10 + u128::from(scale) / 2) / u128::from(scale);
    format!("{}.{} {}", tenths / 10, tenths % 10, SIZE_UNITS[unit])
}

/// `"<used> of <total> used (<n>%), <free> free"`
pub fn format_storage(storage: &StorageCapacity) -> String {
    if storage.total_bytes == 0 {
        return format!("{} used, capacity unknown", format_size(storage.used_bytes));
    }
    let percent = (storage.used_bytes.min(storage.total_bytes) * 100) / storage.total_bytes;
    format!(
        "{} of {} used ({}%), {} free",
        format_size(storage.used_bytes),
        format_size(storage.total_bytes),
        percent,
        format_size(storage.free_bytes())
    )
}

/// `"<n>%: <received> of <total>"`
pub fn format_transfer(progress: &Progress) -> String {
    format!(
        "{}%: {} of {}",
        progress.percent,
        format_size(u64::from(progress.received)),
        format_size(u64::from(progress.total))
    )
}

/// Format a duration in seconds as `h:mm:ss` or `m:ss`
pub fn format_duration(seconds: u32) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(1_048_575), "1024.0 KiB");
        assert_eq!(format_size(1_048_576), "1.0 MiB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MiB");
    }

    #[test]
    fn test_format_size_rounds_to_nearest_tenth() {
        // 1.25 KiB rounds half up
        assert_eq!(format_size(1280), "1.3 KiB");
        assert_eq!(format_size(1228), "1.2 KiB");
        // 32 GiB card reported in KiB
        assert_eq!(format_size(32 * 1024 * 1024 * 1024), "32.0 GiB");
        assert_eq!(format_size(u64::MAX), "16777216.0 TiB");
    }

    #[test]
    fn test_format_storage() {
        let storage = StorageCapacity {
            used_bytes: 1024 * 1024,
            total_bytes: 8192 * 1024,
        };
        assert_eq!(
            format_storage(&storage),
            "1.0 MiB of 8.0 MiB used (12%), 7.0 MiB free"
        );

        let unknown = StorageCapacity {
            used_bytes: 2048,
            total_bytes: 0,
        };
        assert_eq!(format_storage(&unknown), "2.0 KiB used, capacity unknown");

        let overfull = StorageCapacity {
            used_bytes: 9000 * 1024,
            total_bytes: 8192 * 1024,
        };
        assert_eq!(
            format_storage(&overfull),
            "8.8 MiB of 8.0 MiB used (100%), 0 B free"
        );
    }

    #[test]
    fn test_format_transfer() {
        let progress = Progress {
            percent: 50,
            received: 512,
            total: 1024,
        };
        assert_eq!(format_transfer(&progress), "50%: 512 B of 1.0 KiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(95), "1:35");
        assert_eq!(format_duration(3_725), "1:02:05");
    }

    #[test]
    fn test_cli_parses_download() {
        let cli = Cli::try_parse_from([
            "recsync",
            "--simulate",
            "download",
            "REC002.WAV",
            "--output",
            "/tmp/out",
        ])
        .unwrap();

        assert!(cli.simulate);
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Command::Download { name, output } => {
                assert_eq!(name, "REC002.WAV");
                assert_eq!(output, Some(PathBuf::from("/tmp/out")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["recsync"]).is_err());
    }
}
