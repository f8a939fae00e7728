use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use relaydesk_protocol::{ClientEvent, MAX_FRAME_BYTES, RelayConfig, RelayEvent};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Capacity of the inbound event fan-out. Frames dominate the traffic; a
/// subscriber that falls this far behind loses the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Base64 inflates frames by 4/3; leave room for the JSON envelope.
const MAX_MESSAGE_SIZE: usize = MAX_FRAME_BYTES / 3 * 4 + 64 * 1024;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing side of the relay connection, shared by every component that
/// talks to the host.
pub(crate) trait Transport: Send + Sync {
    /// Queue an event for the relay. Never blocks; events queued while the
    /// connection is down are flushed after reconnect.
    fn send(&self, event: ClientEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportStatus {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    Reconnected,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected { reason } => write!(f, "Disconnected: {reason}. Reconnecting..."),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting... (attempt {attempt})"),
            Self::Reconnected => write!(f, "Reconnected!"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TransportEvent {
    Status(TransportStatus),
    Relay(RelayEvent),
}

/// Handle to the relay connection driven by [`run_transport`].
pub(crate) struct RelayHandle {
    outbox: mpsc::UnboundedSender<ClientEvent>,
    events: broadcast::Sender<TransportEvent>,
}

impl RelayHandle {
    /// Create the handle plus the outbox receiver that `run_transport` drains.
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Self { outbox, events }, outbox_rx)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<TransportEvent> {
        self.events.clone()
    }
}

impl Transport for RelayHandle {
    fn send(&self, event: ClientEvent) {
        let name = event.name();
        if self.outbox.send(event).is_err() {
            debug!(event = name, "Relay transport stopped, dropping outgoing event");
        }
    }
}

/// Exponential reconnect schedule with jitter, capped at a maximum delay.
pub(crate) struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    randomization: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub(crate) fn new(initial: Duration, max: Duration, randomization: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            randomization: randomization.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub(crate) fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.reconnect_randomization,
        )
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the given 1-based attempt.
    fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.base_delay(self.attempt);
        if self.randomization == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.randomization..=self.randomization);
        base.mul_f64(factor).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Append the viewer's client id so the relay can route host replies.
pub(crate) fn relay_url(base: &str, client_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}clientId={}", urlencoding::encode(client_id))
}

/// Drive the relay connection until the last [`RelayHandle`] is dropped.
///
/// Reconnects forever with [`ReconnectBackoff`]; status transitions are
/// published on the event channel alongside relay events.
pub(crate) async fn run_transport(
    config: RelayConfig,
    client_id: String,
    outbox_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    events: broadcast::Sender<TransportEvent>,
) -> anyhow::Result<()> {
    let url = relay_url(&config.url, &client_id);
    let connector = if config.url.starts_with("wss://") {
        Some(build_tls_connector(config.tls_cert.as_deref())?)
    } else {
        None
    };
    let keepalive = Duration::from_secs(config.keepalive_interval_secs.max(1));
    let mut backoff = ReconnectBackoff::from_config(&config);
    let mut ever_connected = false;

    loop {
        info!(url = %config.url, "Connecting to relay");
        match connect(&url, connector.clone()).await {
            Ok(socket) => {
                backoff.reset();
                let status = if ever_connected {
                    TransportStatus::Reconnected
                } else {
                    TransportStatus::Connected
                };
                ever_connected = true;
                info!(%status, "Relay connection established");
                let _ = events.send(TransportEvent::Status(status));

                match pump(socket, keepalive, outbox_rx, &events).await {
                    PumpExit::Shutdown => {
                        info!("Relay transport shutting down");
                        return Ok(());
                    }
                    PumpExit::Lost(reason) => {
                        warn!(%reason, "Relay connection lost");
                        let _ = events.send(TransportEvent::Status(TransportStatus::Disconnected {
                            reason,
                        }));
                    }
                }
            }
            Err(e) => {
                warn!("Relay connection failed: {e:#}");
            }
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempt();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
        let _ = events.send(TransportEvent::Status(TransportStatus::Reconnecting { attempt }));
        tokio::time::sleep(delay).await;
    }
}

/// Build a TLS connector, pinning the relay certificate if a cert path is provided.
/// System roots stay trusted either way.
fn build_tls_connector(tls_cert_path: Option<&str>) -> anyhow::Result<tokio_tungstenite::Connector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        let pem_data = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read relay TLS cert from {cert_path}"))?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
            .filter_map(|r| r.ok())
            .collect();
        if certs.is_empty() {
            anyhow::bail!("No certificates found in {cert_path}");
        }
        for cert in certs {
            root_store
                .add(cert)
                .with_context(|| format!("Invalid certificate in {cert_path}"))?;
        }
        info!("Pinned relay certificate from {cert_path}");
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}

async fn connect(
    url: &str,
    connector: Option<tokio_tungstenite::Connector>,
) -> anyhow::Result<RelaySocket> {
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    let (socket, _) =
        tokio_tungstenite::connect_async_tls_with_config(url, Some(ws_config), false, connector)
            .await
            .context("WebSocket connection failed")?;
    Ok(socket)
}

enum PumpExit {
    /// Every handle is gone; stop for good.
    Shutdown,
    /// Connection dropped; reconnect.
    Lost(String),
}

async fn pump(
    socket: RelaySocket,
    keepalive: Duration,
    outbox_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    events: &broadcast::Sender<TransportEvent>,
) -> PumpExit {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut keepalive_timer = tokio::time::interval(keepalive);
    keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    keepalive_timer.tick().await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match RelayEvent::from_wire(&text) {
                            Ok(Some(event)) => {
                                let _ = events.send(TransportEvent::Relay(event));
                            }
                            Ok(None) => {
                                debug!(len = text.len(), "Ignoring unhandled relay event");
                            }
                            Err(e) => {
                                warn!("Invalid message from relay: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "relay closed the connection".to_string());
                        return PumpExit::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    None => return PumpExit::Lost("connection closed".to_string()),
                }
            }
            out = outbox_rx.recv() => {
                let Some(event) = out else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                };
                let text = match event.to_wire() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = event.name(), "Dropping unencodable event: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    return PumpExit::Lost(e.to_string());
                }
            }
            _ = keepalive_timer.tick() => {
                let Ok(text) = ClientEvent::KeepAlive.to_wire() else { continue };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    return PumpExit::Lost(e.to_string());
                }
            }
        }
    }
}
