//! Event IPC channel
//!
//! A line-framed JSON event stream between the proxy process and a UI
//! client over the OS-native local IPC primitive: a named pipe on
//! Windows, a Unix domain socket elsewhere. Each frame is one event
//! encoded as a single line of UTF-8 JSON; JSON string escaping
//! guarantees no frame spans more than one line.
//!
//! The server accepts one client at a time and resumes accepting when it
//! disconnects. The client redials forever with a fixed back-off, so
//! either side can restart without coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};

/// Default endpoint name
#[cfg(unix)]
pub const DEFAULT_ENDPOINT: &str = "/run/dnsveil.sock";

#[cfg(windows)]
pub const DEFAULT_ENDPOINT: &str = r"\\.\pipe\dnsveil";

/// Per-attempt dial timeout for the client
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between failed dial attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound frames buffered while the writer catches up
const SEND_QUEUE_DEPTH: usize = 64;

/// Structured payload carried by an event frame
///
/// Every field is optional; an absent field means "not carried by this
/// event" and is omitted from the encoded frame entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_device_name: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_updates: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_channel: Option<String>,
}

/// One event frame: a kind name plus optional payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<EventData>,
}

impl Event {
    /// An event with no payload
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    /// A `status` event carrying the proxy run state
    pub fn status(enabled: bool) -> Self {
        Self {
            name: "status".into(),
            data: Some(EventData {
                enabled: Some(enabled),
                ..Default::default()
            }),
        }
    }

    /// An `error` event carrying a human-readable message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            name: "error".into(),
            data: Some(EventData {
                error: Some(message.into()),
                ..Default::default()
            }),
        }
    }

    /// Encode as a single newline-terminated JSON line
    fn encode(&self) -> Result<String> {
        if self.name.is_empty() {
            return Err(Error::Ipc("event name must not be empty".into()));
        }
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::Ipc(format!("failed to encode event: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

/// Decode one frame, requiring a non-empty name
fn decode(line: &str) -> Result<Event> {
    let event: Event = serde_json::from_str(line)
        .map_err(|e| Error::Ipc(format!("invalid event frame: {}", e)))?;
    if event.name.is_empty() {
        return Err(Error::Ipc("event frame missing name".into()));
    }
    Ok(event)
}

/// Handler for events arriving from the peer
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// A decoded frame arrived
    async fn on_event(&self, event: Event);

    /// The stream (re-)connected
    async fn on_connected(&self) {}
}

/// Cheap handle for pushing events onto a live channel
///
/// Sends fail while no peer is attached; frames are not queued across
/// reconnects.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    connected: Arc<AtomicBool>,
}

impl EventSender {
    /// Queue an event for the peer
    pub fn send(&self, event: Event) -> Result<()> {
        if event.name.is_empty() {
            return Err(Error::Ipc("event name must not be empty".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Ipc("event channel not connected".into()));
        }
        self.tx
            .try_send(event)
            .map_err(|e| Error::Ipc(format!("event channel backlogged: {}", e)))
    }

    /// Whether a peer is currently attached
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// How a stream session ended
enum StreamEnd {
    /// Shutdown was requested; pending writes were drained
    Disposed,
    /// The peer went away
    Eof,
}

/// Bridge one connected stream: decode inbound lines into the handler,
/// encode queued events onto the writer. A malformed frame is dropped
/// with a log line; the connection survives it.
async fn pump_stream<S>(
    stream: S,
    handler: &Arc<dyn EventHandler>,
    outbound: &mut mpsc::Receiver<Event>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<StreamEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                // drain pending writes before closing
                while let Ok(event) = outbound.try_recv() {
                    let line = event.encode()?;
                    let _ = writer.write_all(line.as_bytes()).await;
                }
                let _ = writer.flush().await;
                return Ok(StreamEnd::Disposed);
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match decode(line) {
                            Ok(event) => handler.on_event(event).await,
                            Err(e) => log::warn!("Dropping malformed event frame: {}", e),
                        }
                    }
                    Ok(None) => return Ok(StreamEnd::Eof),
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            event = outbound.recv() => {
                match event {
                    Some(event) => {
                        let line = event.encode()?;
                        writer.write_all(line.as_bytes()).await.map_err(Error::Io)?;
                    }
                    None => return Ok(StreamEnd::Disposed),
                }
            }
        }
    }
}

/// Event server: the proxy-side endpoint a UI client attaches to
pub struct EventServer {
    endpoint: String,
    handler: Arc<dyn EventHandler>,
    outbound_rx: mpsc::Receiver<Event>,
    connected: Arc<AtomicBool>,
}

impl EventServer {
    /// Create a server for `endpoint` and the sender half used to push
    /// events to whichever client is attached
    pub fn new(endpoint: impl Into<String>, handler: Arc<dyn EventHandler>) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let connected = Arc::new(AtomicBool::new(false));
        let sender = EventSender {
            tx,
            connected: connected.clone(),
        };
        (
            Self {
                endpoint: endpoint.into(),
                handler,
                outbound_rx: rx,
                connected,
            },
            sender,
        )
    }

    /// Accept clients until `shutdown` fires, one at a time
    #[cfg(unix)]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        use tokio::net::UnixListener;

        // Remove a stale socket from a previous run
        let _ = std::fs::remove_file(&self.endpoint);
        if let Some(parent) = std::path::Path::new(&self.endpoint).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.endpoint)
            .map_err(|e| Error::Ipc(format!("failed to bind event endpoint: {}", e)))?;

        log::info!("Event channel listening on {}", self.endpoint);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            log::warn!("Event channel accept error: {}", e);
                            continue;
                        }
                    };
                    if self.serve_client(stream, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.endpoint);
        Ok(())
    }

    /// Accept clients until `shutdown` fires, one at a time
    #[cfg(windows)]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.endpoint)
            .map_err(|e| Error::Ipc(format!("failed to create named pipe: {}", e)))?;

        log::info!("Event channel listening on {}", self.endpoint);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                connected = server.connect() => {
                    if let Err(e) = connected {
                        log::warn!("Event channel accept error: {}", e);
                        continue;
                    }

                    // Next instance has to exist before this one is served,
                    // otherwise a client dialing during the session gets
                    // a hard failure instead of a busy pipe.
                    let next = match ServerOptions::new().create(&self.endpoint) {
                        Ok(next) => next,
                        Err(e) => {
                            log::warn!("Failed to create next pipe instance: {}", e);
                            continue;
                        }
                    };
                    let pipe = std::mem::replace(&mut server, next);
                    if self.serve_client(pipe, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve one attached client until it goes away or shutdown fires.
    /// Returns true when shutdown was observed and the server should stop
    /// accepting.
    async fn serve_client<S>(&mut self, stream: S, shutdown: &mut broadcast::Receiver<()>) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connected.store(true, Ordering::SeqCst);
        self.handler.on_connected().await;

        let result = pump_stream(stream, &self.handler, &mut self.outbound_rx, shutdown).await;
        self.connected.store(false, Ordering::SeqCst);

        match result {
            Ok(StreamEnd::Eof) => {
                log::debug!("Event client disconnected");
                false
            }
            Ok(StreamEnd::Disposed) => true,
            Err(e) => {
                log::debug!("Event connection error: {}", e);
                false
            }
        }
    }
}

/// Event client: dials the endpoint, retrying forever, and keeps the
/// stream alive across server restarts
pub struct EventClient {
    endpoint: String,
    handler: Arc<dyn EventHandler>,
    outbound_rx: mpsc::Receiver<Event>,
    connected: Arc<AtomicBool>,
}

impl EventClient {
    /// Create a client for `endpoint` and the sender half used to push
    /// events while connected
    pub fn new(endpoint: impl Into<String>, handler: Arc<dyn EventHandler>) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let connected = Arc::new(AtomicBool::new(false));
        let sender = EventSender {
            tx,
            connected: connected.clone(),
        };
        (
            Self {
                endpoint: endpoint.into(),
                handler,
                outbound_rx: rx,
                connected,
            },
            sender,
        )
    }

    /// Dial and pump until `shutdown` fires.
    ///
    /// Runs the reconnect cycle as one flat loop: dial (5 s per attempt,
    /// 5 s between failures), fire the connected notification, pump until
    /// the stream dies, repeat. A flapping server never grows the stack.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let stream = loop {
                let attempt = tokio::time::timeout(CONNECT_TIMEOUT, dial(&self.endpoint));
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    result = attempt => match result {
                        Ok(Ok(stream)) => break stream,
                        Ok(Err(e)) => log::debug!("Event endpoint not reachable: {}", e),
                        Err(_) => log::debug!("Event endpoint dial timed out"),
                    }
                }
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            };

            self.connected.store(true, Ordering::SeqCst);
            self.handler.on_connected().await;

            let result =
                pump_stream(stream, &self.handler, &mut self.outbound_rx, &mut shutdown).await;
            self.connected.store(false, Ordering::SeqCst);

            match result {
                Ok(StreamEnd::Disposed) => return Ok(()),
                Ok(StreamEnd::Eof) => log::debug!("Event stream closed, reconnecting"),
                Err(e) => log::debug!("Event stream error, reconnecting: {}", e),
            }
        }
    }
}

#[cfg(unix)]
async fn dial(endpoint: &str) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(endpoint).await
}

#[cfg(windows)]
async fn dial(
    endpoint: &str,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    use tokio::net::windows::named_pipe::ClientOptions;
    // A busy pipe surfaces as an error here; the caller's retry loop
    // handles it like any other failed dial.
    ClientOptions::new().open(endpoint)
}
