//! Async Recorder Client
//!
//! Runs a [`SyncEngine`] on a tokio task next to a [`Transport`]. The task
//! owns both; callers talk to it through a command channel and get one
//! event stream per request.
//!
//! ```no_run
//! use recsync_protocol::{EngineConfig, RecorderClient, SimulatedRecorder, SimulatorConfig};
//!
//! # async fn run() -> recsync_protocol::Result<()> {
//! let recorder = SimulatedRecorder::new(SimulatorConfig::default());
//! let client = RecorderClient::spawn(Box::new(recorder), EngineConfig::default());
//!
//! client.connect().await?;
//! let files = client.request_file_list().await?.finish().await?;
//! if let Some(entry) = files.first() {
//!     let file = client.request_download(entry.clone()).await?.finish().await?;
//!     println!("{}: {} bytes", file.name(), file.data.len());
//! }
//! client.shutdown().await
//! # }
//! ```

use crate::download::{DownloadedFile, Progress};
use crate::engine::{EngineConfig, SyncEngine};
use crate::events::{DownloadEvent, ListEvent};
use crate::file_list::DeviceFileEntry;
use crate::state::ConnectionState;
use crate::status::DeviceStatus;
use crate::transport::{ChannelWriter, Transport, TransportEvent};
use crate::{ProtocolError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Commands sent to the client task
enum ClientCommand {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    ListFiles {
        sink: mpsc::UnboundedSender<ListEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    Download {
        entry: DeviceFileEntry,
        sink: mpsc::UnboundedSender<DownloadEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    RefreshStatus(oneshot::Sender<Result<()>>),
    SubscribeState(oneshot::Sender<mpsc::UnboundedReceiver<ConnectionState>>),
    SubscribeStatus(oneshot::Sender<mpsc::UnboundedReceiver<DeviceStatus>>),
    Snapshot(oneshot::Sender<(ConnectionState, DeviceStatus)>),
    Shutdown,
}

fn client_stopped() -> ProtocolError {
    ProtocolError::Cancelled("recorder client stopped".to_string())
}

/// Handle to a running recorder client task
#[derive(Debug)]
pub struct RecorderClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl RecorderClient {
    /// Spawn the client task on the current tokio runtime
    pub fn spawn(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        let (writer, outbound) = ChannelWriter::new(transport.capabilities().max_write_size);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine: SyncEngine::new(writer, config),
            transport,
            events: None,
            outbound,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Self { commands, task }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ClientCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| client_stopped())?;
        rx.await.map_err(|_| client_stopped())
    }

    /// Find the recorder and bring the link up
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidState` if already connected, or the
    /// transport's error if the recorder could not be reached.
    pub async fn connect(&self) -> Result<()> {
        self.request(ClientCommand::Connect).await?
    }

    /// Tear the link down and fail any in-flight request with `Cancelled`
    pub async fn disconnect(&self) -> Result<()> {
        self.request(ClientCommand::Disconnect).await?
    }

    /// Start listing the recorder's files
    pub async fn request_file_list(&self) -> Result<FileListing> {
        let (sink, events) = mpsc::unbounded_channel();
        self.request(|reply| ClientCommand::ListFiles { sink, reply })
            .await??;
        Ok(FileListing { events })
    }

    /// Start downloading a listed file
    pub async fn request_download(&self, entry: DeviceFileEntry) -> Result<Download> {
        let (sink, events) = mpsc::unbounded_channel();
        self.request(|reply| ClientCommand::Download { entry, sink, reply })
            .await??;
        Ok(Download { events })
    }

    /// Query battery, capacity and firmware version again
    pub async fn refresh_status(&self) -> Result<()> {
        self.request(ClientCommand::RefreshStatus).await?
    }

    /// Subscribe to connection state changes, starting with the current state
    pub async fn subscribe_state(&self) -> Result<mpsc::UnboundedReceiver<ConnectionState>> {
        self.request(ClientCommand::SubscribeState).await
    }

    /// Subscribe to device status changes, starting with the current status
    pub async fn subscribe_status(&self) -> Result<mpsc::UnboundedReceiver<DeviceStatus>> {
        self.request(ClientCommand::SubscribeStatus).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        Ok(self.request(ClientCommand::Snapshot).await?.0)
    }

    pub async fn status(&self) -> Result<DeviceStatus> {
        Ok(self.request(ClientCommand::Snapshot).await?.1)
    }

    /// Disconnect if needed and stop the client task
    pub async fn shutdown(self) -> Result<()> {
        // The task may already be gone
        let _ = self.commands.send(ClientCommand::Shutdown);
        self.task
            .await
            .map_err(|e| ProtocolError::Transport(format!("client task failed: {}", e)))
    }
}

/// Pending file list request
#[derive(Debug)]
pub struct FileListing {
    events: mpsc::UnboundedReceiver<ListEvent>,
}

impl FileListing {
    /// Next event, or `None` once the terminal event was delivered
    pub async fn next_event(&mut self) -> Option<ListEvent> {
        self.events.recv().await
    }

    /// Wait for the final list
    pub async fn finish(mut self) -> Result<Vec<DeviceFileEntry>> {
        while let Some(event) = self.events.recv().await {
            match event {
                ListEvent::Partial(entries) => {
                    debug!("Listing in progress: {} entries", entries.len())
                }
                ListEvent::Complete(entries) => return Ok(entries),
                ListEvent::Failed(e) => return Err(e),
            }
        }
        Err(client_stopped())
    }
}

/// Pending download request
#[derive(Debug)]
pub struct Download {
    events: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl Download {
    /// Next event, or `None` once the terminal event was delivered
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Wait for the finished file, reporting progress along the way
    pub async fn finish_with_progress<F>(mut self, mut on_progress: F) -> Result<DownloadedFile>
    where
        F: FnMut(Progress),
    {
        while let Some(event) = self.events.recv().await {
            match event {
                DownloadEvent::Progress(progress) => on_progress(progress),
                DownloadEvent::Complete(file) => return Ok(file),
                DownloadEvent::Failed(e) => return Err(e),
            }
        }
        Err(client_stopped())
    }

    /// Wait for the finished file
    pub async fn finish(self) -> Result<DownloadedFile> {
        self.finish_with_progress(|_| {}).await
    }
}

/// State owned by the client task
struct Driver {
    engine: SyncEngine<ChannelWriter>,
    transport: Box<dyn Transport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
        info!("Recorder client started");

        loop {
            let deadline = self.engine.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = next_event(&mut self.events) => self.handle_transport_event(event),
                _ = sleep_until(deadline) => self.engine.poll_timers(now()),
            }

            self.flush().await;
        }

        if self.transport.is_connected() {
            if let Err(e) = self.disconnect().await {
                warn!("Error disconnecting during shutdown: {}", e);
            }
        }
        info!("Recorder client stopped");
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            ClientCommand::Disconnect(reply) => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            ClientCommand::ListFiles { sink, reply } => {
                let _ = reply.send(self.engine.request_file_list(sink, now()));
            }
            ClientCommand::Download { entry, sink, reply } => {
                let _ = reply.send(self.engine.request_download(entry, sink, now()));
            }
            ClientCommand::RefreshStatus(reply) => {
                let _ = reply.send(self.engine.refresh_status());
            }
            ClientCommand::SubscribeState(reply) => {
                let _ = reply.send(self.engine.subscribe_state());
            }
            ClientCommand::SubscribeStatus(reply) => {
                let _ = reply.send(self.engine.subscribe_status());
            }
            ClientCommand::Snapshot(reply) => {
                let _ = reply.send((self.engine.state(), self.engine.status().clone()));
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Notification { endpoint, bytes }) => {
                self.engine.on_notification(endpoint, &bytes, now());
            }
            Some(TransportEvent::Disconnected { reason }) => {
                self.events = None;
                self.engine.link_lost(reason.as_deref());
            }
            None => {
                self.events = None;
                self.engine.link_lost(Some("transport event stream closed"));
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.engine.connect_requested()?;

        match self.transport.connect().await {
            Ok(events) => {
                self.events = Some(events);
                self.engine.link_established(now())
            }
            Err(e) => {
                warn!("Failed to connect to recorder: {}", e);
                if let Err(state_error) = self.engine.link_failed() {
                    debug!("{}", state_error);
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.events = None;
        self.engine.disconnect();
        while self.outbound.try_recv().is_ok() {}

        if self.transport.is_connected() {
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    /// Send everything the engine queued since the last flush
    async fn flush(&mut self) {
        while let Ok(bytes) = self.outbound.try_recv() {
            if !self.transport.is_connected() {
                debug!("Dropping {} queued bytes, link is down", bytes.len());
                continue;
            }
            if let Err(e) = self.transport.write(&bytes).await {
                warn!("Write to recorder failed: {}", e);
            }
        }
    }
}

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
