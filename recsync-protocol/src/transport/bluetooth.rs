//! Bluetooth Low Energy Transport
//!
//! GATT transport for the recorder using BlueZ via the bluer crate.
//!
//! The recorder exposes one service with three characteristics: a write
//! characteristic for commands and two notify characteristics ("data" and
//! "status"). Each notify stream is forwarded by its own task; a third task
//! watches the device's `Connected` property to report link loss.

use super::{
    Endpoint, Transport, TransportCapabilities, TransportEvent, DEFAULT_MAX_WRITE_SIZE,
    RECORDER_DATA_CHAR_UUID, RECORDER_SERVICE_UUID, RECORDER_STATUS_CHAR_UUID,
    RECORDER_WRITE_CHAR_UUID,
};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time spent scanning for the recorder
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for the BLE transport
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    /// Connect to this address only (e.g. "00:11:22:33:44:55")
    pub address: Option<String>,
    /// Otherwise, connect to the first device whose name starts with this
    pub name_prefix: String,
    pub scan_timeout: Duration,
    pub service_uuid: Uuid,
    pub write_uuid: Uuid,
    pub data_uuid: Uuid,
    pub status_uuid: Uuid,
    pub max_write_size: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_prefix: "REC".to_string(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            service_uuid: RECORDER_SERVICE_UUID,
            write_uuid: RECORDER_WRITE_CHAR_UUID,
            data_uuid: RECORDER_DATA_CHAR_UUID,
            status_uuid: RECORDER_STATUS_CHAR_UUID,
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
        }
    }
}

fn bt_error(context: &str, e: bluer::Error) -> ProtocolError {
    ProtocolError::Transport(format!("{}: {}", context, e))
}

/// Background tasks of one link, aborted when dropped
#[derive(Debug, Default)]
struct LinkTasks(Vec<JoinHandle<()>>);

impl LinkTasks {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Open link to a recorder
struct Link {
    device: Device,
    write_char: Characteristic,
    /// Cleared by the connection watcher when BlueZ reports the drop
    alive: Arc<AtomicBool>,
    _tasks: LinkTasks,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// BLE GATT transport
pub struct BluetoothTransport {
    config: BluetoothConfig,
    link: Option<Link>,
}

impl BluetoothTransport {
    pub fn new(config: BluetoothConfig) -> Self {
        Self { config, link: None }
    }

    /// Scan until a matching recorder shows up or the scan times out
    async fn find_device(&self, adapter: &Adapter) -> Result<Device> {
        if let Some(address) = &self.config.address {
            let address = Address::from_str(address).map_err(|e| {
                ProtocolError::Configuration(format!(
                    "Invalid Bluetooth address '{}': {}",
                    address, e
                ))
            })?;
            let device = adapter
                .device(address)
                .map_err(|e| bt_error("Failed to get device", e))?;
            // Known to BlueZ already: no scan needed
            if device.is_paired().await.unwrap_or(false) || device.name().await.is_ok() {
                return Ok(device);
            }
        }

        info!(
            "Scanning for recorder (prefix '{}', {}s)",
            self.config.name_prefix,
            self.config.scan_timeout.as_secs()
        );
        let discover = adapter
            .discover_devices()
            .await
            .map_err(|e| bt_error("Failed to start discovery", e))?;

        let search = async {
            pin_mut!(discover);
            while let Some(event) = discover.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                if self.matches(&device).await {
                    return Some(device);
                }
            }
            None
        };

        match timeout(self.config.scan_timeout, search).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) | Err(_) => Err(ProtocolError::DeviceNotFound(format!(
                "no recorder matching '{}' found",
                self.config
                    .address
                    .as_deref()
                    .unwrap_or(&self.config.name_prefix)
            ))),
        }
    }

    async fn matches(&self, device: &Device) -> bool {
        if let Some(address) = &self.config.address {
            return device.address().to_string().eq_ignore_ascii_case(address);
        }

        match device.name().await {
            Ok(Some(name)) => {
                debug!("Discovered {} ({})", name, device.address());
                name.starts_with(&self.config.name_prefix)
            }
            _ => false,
        }
    }

    /// Locate the write, data and status characteristics
    async fn characteristics(
        &self,
        device: &Device,
    ) -> Result<(Characteristic, Characteristic, Characteristic)> {
        let services = device
            .services()
            .await
            .map_err(|e| bt_error("Failed to resolve services", e))?;

        for service in services {
            let uuid = service
                .uuid()
                .await
                .map_err(|e| bt_error("Failed to read service UUID", e))?;
            if uuid != self.config.service_uuid {
                continue;
            }

            let mut write = None;
            let mut data = None;
            let mut status = None;
            for characteristic in service
                .characteristics()
                .await
                .map_err(|e| bt_error("Failed to list characteristics", e))?
            {
                let uuid = characteristic
                    .uuid()
                    .await
                    .map_err(|e| bt_error("Failed to read characteristic UUID", e))?;
                if uuid == self.config.write_uuid {
                    write = Some(characteristic);
                } else if uuid == self.config.data_uuid {
                    data = Some(characteristic);
                } else if uuid == self.config.status_uuid {
                    status = Some(characteristic);
                }
            }

            return match (write, data, status) {
                (Some(write), Some(data), Some(status)) => Ok((write, data, status)),
                _ => Err(ProtocolError::Transport(format!(
                    "service {} is missing a recorder characteristic",
                    uuid
                ))),
            };
        }

        Err(ProtocolError::DeviceNotFound(format!(
            "device {} does not expose service {}",
            device.address(),
            self.config.service_uuid
        )))
    }
}

/// Forward one notify characteristic into the event channel
async fn forward_notifications(
    characteristic: Characteristic,
    endpoint: Endpoint,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<JoinHandle<()>> {
    let stream = characteristic
        .notify()
        .await
        .map_err(|e| bt_error("Failed to subscribe to notifications", e))?;

    Ok(tokio::spawn(async move {
        pin_mut!(stream);
        while let Some(bytes) = stream.next().await {
            debug!("{} notification: {} bytes", endpoint, bytes.len());
            if event_tx
                .send(TransportEvent::Notification { endpoint, bytes })
                .is_err()
            {
                break;
            }
        }
        debug!("{} notification stream ended", endpoint);
    }))
}

/// Report the link going down
async fn watch_connection(
    device: Device,
    alive: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<JoinHandle<()>> {
    let events = device
        .events()
        .await
        .map_err(|e| bt_error("Failed to watch device", e))?;

    Ok(tokio::spawn(async move {
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                alive.store(false, Ordering::SeqCst);
                warn!("Recorder {} disconnected", device.address());
                let _ = event_tx.send(TransportEvent::Disconnected {
                    reason: Some("device disconnected".to_string()),
                });
                break;
            }
        }
    }))
}

/// Start the two notification forwarders and the connection watcher
///
/// Tasks already started are aborted if a later one fails.
async fn spawn_link_tasks(
    device: &Device,
    data_char: Characteristic,
    status_char: Characteristic,
    alive: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<LinkTasks> {
    let mut tasks = LinkTasks::default();
    tasks.push(forward_notifications(data_char, Endpoint::Data, event_tx.clone()).await?);
    tasks.push(forward_notifications(status_char, Endpoint::Status, event_tx.clone()).await?);
    tasks.push(watch_connection(device.clone(), alive, event_tx).await?);
    Ok(tasks)
}

impl std::fmt::Debug for BluetoothTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluetoothTransport")
            .field("address", &self.config.address)
            .field("name_prefix", &self.config.name_prefix)
            .field(
                "device",
                &self.link.as_ref().map(|l| l.device.address().to_string()),
            )
            .finish()
    }
}

#[async_trait]
impl Transport for BluetoothTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_write_size: self.config.max_write_size,
        }
    }

    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        // A link that dropped on its own is still stored
        if let Some(stale) = self.link.take() {
            debug!("Discarding stale link to {}", stale.device.address());
            let device = stale.device.clone();
            drop(stale);
            let _ = device.disconnect().await;
        }

        let session = Session::new()
            .await
            .map_err(|e| bt_error("Failed to open BlueZ session", e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| bt_error("No Bluetooth adapter", e))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| bt_error("Failed to power adapter", e))?;

        let device = self.find_device(&adapter).await?;
        info!("Connecting to recorder {}", device.address());

        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| bt_error("Failed to connect", e))?;
        }

        let (write_char, data_char, status_char) = match self.characteristics(&device).await {
            Ok(chars) => chars,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let tasks = match spawn_link_tasks(
            &device,
            data_char,
            status_char,
            alive.clone(),
            event_tx,
        )
        .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
        };

        info!("Recorder {} ready", device.address());
        self.link = Some(Link {
            device,
            write_char,
            alive,
            _tasks: tasks,
        });
        Ok(event_rx)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.is_alive())
            .ok_or_else(|| ProtocolError::Transport("not connected".to_string()))?;

        link.write_char
            .write(bytes)
            .await
            .map_err(|e| bt_error("GATT write failed", e))
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };

        let alive = link.is_alive();
        let device = link.device.clone();
        drop(link);
        if !alive {
            debug!("Link to {} already down", device.address());
            return Ok(());
        }

        info!("Disconnecting from recorder {}", device.address());
        device
            .disconnect()
            .await
            .map_err(|e| bt_error("Failed to disconnect", e))
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BluetoothConfig::default();
        assert_eq!(config.service_uuid, RECORDER_SERVICE_UUID);
        assert_eq!(config.max_write_size, DEFAULT_MAX_WRITE_SIZE);
        assert!(config.address.is_none());
    }

    /// Task that holds `held` until it is aborted
    fn holding_task(held: Arc<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await
        })
    }

    async fn wait_released(held: &Arc<()>) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(held) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("link tasks were not aborted");
    }

    /// Second step fails after the first task was started
    async fn start_then_fail(held: Arc<()>) -> Result<LinkTasks> {
        let mut tasks = LinkTasks::default();
        tasks.push(holding_task(held));
        Err::<(), _>(ProtocolError::Transport("notify failed".to_string()))?;
        Ok(tasks)
    }

    #[tokio::test]
    async fn test_link_tasks_aborted_on_drop() {
        let held = Arc::new(());
        let mut tasks = LinkTasks::default();
        tasks.push(holding_task(held.clone()));
        tasks.push(holding_task(held.clone()));
        assert_eq!(Arc::strong_count(&held), 3);

        drop(tasks);
        wait_released(&held).await;
    }

    #[tokio::test]
    async fn test_started_tasks_aborted_when_link_setup_fails() {
        let held = Arc::new(());
        assert!(start_then_fail(held.clone()).await.is_err());
        wait_released(&held).await;
    }

    #[test]
    fn test_capabilities_follow_config() {
        let transport = BluetoothTransport::new(BluetoothConfig {
            max_write_size: 182,
            ..Default::default()
        });
        assert_eq!(transport.capabilities().max_write_size, 182);
        assert!(!transport.is_connected());
    }
}
