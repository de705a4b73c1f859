//! Persistent WebSocket connection to one gateway.
//!
//! A single supervising task loops through
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                         │                 │
//!      └──── backoff sleep ◀─────┴── error/close ──┘
//! ```
//!
//! until [`GatewayConnection::stop`] is called. Every way a session can end
//! (refused connect, timeout, read error, close frame) is folded into a
//! [`SessionEnd`]; the supervisor reacts the same way to all of them: drop
//! the socket, report `Disconnected`, back off, retry.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::bus::{Channel, Subscription};
use crate::config::WebSocketConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    decode_text, InboundMessage, OutboundCommand, INITIAL_RECONNECT_DELAY_SECS,
    MAX_RECONNECT_DELAY_SECS,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect delay: starts at `floor`, doubles per failure,
/// never exceeds `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait now; the following call returns double (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS),
            Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS),
            backoff_ceiling: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(cfg: &WebSocketConfig) -> Self {
        Self {
            backoff_floor: Duration::from_secs(cfg.backoff_floor_secs),
            backoff_ceiling: Duration::from_secs(cfg.backoff_ceiling_secs),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
        }
    }
}

/// Why a session ended. The supervisor does not branch on it beyond
/// logging.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    ConnectFailed(BridgeError),
    ConnectTimedOut,
    ReadFailed(BridgeError),
    ClosedByPeer,
}

struct Shared {
    mac: String,
    url: String,
    status: Mutex<ConnectionStatus>,
    status_channel: Channel<ConnectionStatus>,
    messages: Channel<InboundMessage>,
    writer: AsyncMutex<Option<WsWriter>>,
    connect_attempts: AtomicU64,
}

impl Shared {
    /// Notify status subscribers, only on an actual transition.
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        log::info!("Gateway {} websocket {:?}", self.mac, status);
        self.status_channel.publish(&status);
    }

    fn not_connected(&self) -> BridgeError {
        BridgeError::NotConnected {
            mac: self.mac.clone(),
        }
    }
}

pub struct GatewayConnection {
    shared: Arc<Shared>,
    options: ConnectionOptions,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayConnection {
    pub fn new(mac: &str, ip: &str, port: u16, path: &str, options: ConnectionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                mac: mac.to_string(),
                url: websocket_url(ip, port, path),
                status: Mutex::new(ConnectionStatus::Disconnected),
                status_channel: Channel::new(),
                messages: Channel::new(),
                writer: AsyncMutex::new(None),
                connect_attempts: AtomicU64::new(0),
            }),
            options,
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn mac(&self) -> &str {
        &self.shared.mac
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Spawn the supervising task. A no-op while it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *task = Some(tokio::spawn(supervise(
            self.shared.clone(),
            self.options.clone(),
            cancel,
        )));
    }

    /// Stop the supervisor and wait until it has exited. Unblocks a pending
    /// connect, read or backoff sleep. Idempotent.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            log::debug!("Gateway {} websocket supervisor stopped", self.shared.mac);
        }
    }

    /// Send one JSON command. Fails with [`BridgeError::NotConnected`] when
    /// no socket is live; nothing is queued for later.
    /// A send stalled by backpressure is abandoned once [`stop`] is called.
    ///
    /// [`stop`]: GatewayConnection::stop
    pub async fn send(&self, command: &OutboundCommand) -> Result<()> {
        let text = serde_json::to_string(command)?;
        let cancel = self.cancel.lock().clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(self.shared.not_connected()),
            sent = self.write_text(text) => sent,
        }
    }

    async fn write_text(&self, text: String) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| self.shared.not_connected())?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Decoded text frames.
    pub fn subscribe_messages(
        &self,
        callback: impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.messages.subscribe(callback)
    }

    /// Status transitions. `callback` is invoked once immediately with the
    /// current status.
    pub fn subscribe_status(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        callback(&self.status());
        self.shared.status_channel.subscribe(callback)
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
    }
}

pub fn websocket_url(ip: &str, port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("ws://{}:{}{}", ip, port, path)
    } else {
        format!("ws://{}:{}/{}", ip, port, path)
    }
}

async fn supervise(shared: Arc<Shared>, options: ConnectionOptions, cancel: CancellationToken) {
    let mut backoff = Backoff::new(options.backoff_floor, options.backoff_ceiling);

    while !cancel.is_cancelled() {
        let end = run_session(&shared, &options, &cancel, &mut backoff).await;

        // Close whatever is left of the socket before anyone can observe
        // the Disconnected status.
        let writer = shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // A peer that stopped reading cannot take the close frame.
            if timeout(options.connect_timeout, writer.close()).await.is_err() {
                log::debug!("Gateway {} did not accept the close frame", shared.mac);
            }
        }
        shared.set_status(ConnectionStatus::Disconnected);

        match &end {
            SessionEnd::Cancelled => break,
            SessionEnd::ClosedByPeer => {
                log::info!("Gateway {} closed the websocket", shared.mac)
            }
            other => log::warn!("Gateway {} websocket error: {:?}", shared.mac, other),
        }

        if cancel.is_cancelled() {
            break;
        }

        let delay = backoff.next_delay();
        log::info!(
            "Gateway {} reconnecting in {}s …",
            shared.mac,
            delay.as_secs_f32()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    log::debug!("Gateway {} reconnect loop stopped", shared.mac);
}

async fn run_session(
    shared: &Arc<Shared>,
    options: &ConnectionOptions,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> SessionEnd {
    shared.set_status(ConnectionStatus::Connecting);
    shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
    log::debug!("Connecting to gateway {} at {}", shared.mac, shared.url);

    let connected = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        r = timeout(options.connect_timeout, connect_async(shared.url.as_str())) => r,
    };

    let stream = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => return SessionEnd::ConnectFailed(e.into()),
        Err(_) => return SessionEnd::ConnectTimedOut,
    };

    let (writer, reader) = stream.split();
    *shared.writer.lock().await = Some(writer);
    backoff.reset();
    shared.set_status(ConnectionStatus::Connected);

    read_frames(shared, reader, cancel).await
}

async fn read_frames(
    shared: &Arc<Shared>,
    mut reader: WsReader,
    cancel: &CancellationToken,
) -> SessionEnd {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            incoming = reader.next() => incoming,
        };

        match incoming {
            Some(Ok(Message::Text(text))) => match decode_text(text.as_str()) {
                Ok(message) => {
                    shared.messages.publish(&message);
                }
                Err(e) => {
                    log::debug!(
                        "Discarding websocket frame from {}: {}; raw={}",
                        shared.mac,
                        e,
                        text.as_str()
                    );
                }
            },
            Some(Ok(Message::Close(_))) | None => return SessionEnd::ClosedByPeer,
            Some(Ok(_)) => {}
            Some(Err(e)) => return SessionEnd::ReadFailed(e.into()),
        }
    }
}
