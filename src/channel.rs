//! Reconnecting event-channel client.
//!
//! ## Design
//! - [`ChannelClient`] is a handle owned by one room session. `connect` spawns
//!   a background connection task; the handle keeps the task's shutdown signal.
//! - The connection task owns the transport. It multiplexes outgoing envelopes
//!   (from the [`Outbox`]), incoming frames, an optional heartbeat and the
//!   shutdown signal with `tokio::select!`.
//! - Incoming frames are decoded and fanned out through the client's
//!   [`Dispatcher`] on the connection task, so delivery is FIFO per connection.
//! - Connection state is published on a `watch` channel; nothing outside the
//!   connection task and the handle writes it.
//!
//! ## Reconnection
//! An unexpected close or a failed connect counts as one failure. After
//! failure *n* a reconnect is scheduled with [`ReconnectPolicy::delay_for`]`(n)`
//! unless the policy is exhausted, in which case the status becomes
//! `Disconnected` with `gave_up = true` and the task exits. A successful open
//! resets the count. Subscriptions live in the dispatcher, not the connection,
//! so they survive reconnects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::envelope::{Envelope, Event, PeerRole};
use crate::error::ConnectionError;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        write!(f, "{s}")
    }
}

/// Connectivity as surfaced to the UI layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// Consecutive failures since the last successful open.
    pub failures: u32,
    /// Reconnection was abandoned; only a new `connect` call recovers.
    pub gave_up: bool,
}

impl ChannelStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_reconnecting(&self) -> bool {
        self.failures > 0 && !self.gave_up && self.state != ConnectionState::Open
    }
}

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnect attempts allowed after a failure. Zero disables reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` when the
    /// policy is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Tuning for a [`ChannelClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub reconnect: ReconnectPolicy,
    /// Interval for `ping` envelopes while open. `None` disables them.
    pub heartbeat: Option<Duration>,
    /// How long `disconnect` waits for the connection task before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Where a connection goes: a server URL scoped by room and role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub room_id: String,
    pub role: PeerRole,
}

impl Endpoint {
    /// `{base_url}?room_id=..&role=..`
    pub fn url(&self) -> Result<String, ConnectionError> {
        reqwest::Url::parse_with_params(
            &self.base_url,
            &[("room_id", self.room_id.as_str()), ("role", self.role.as_str())],
        )
        .map(|u| u.to_string())
        .map_err(|e| ConnectionError::InvalidUrl {
            url: self.base_url.clone(),
            detail: e.to_string(),
        })
    }
}

/// A connected, text-framed, bidirectional message pipe.
pub trait Transport: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next text frame. `None` means the peer closed the connection.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, ConnectionError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Opens transports. Called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<WsTransport, ConnectionError> {
        let url = endpoint.url()?;
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Connect { url: url.clone(), detail: e.to_string() })?;
        Ok(WsTransport { stream })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ConnectionError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("dropping non-utf8 binary frame"),
                },
                Ok(WsMessage::Close(_)) => return None,
                // Ping/pong frames are answered by tungstenite itself.
                Ok(_) => {}
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Cloneable sending half of a channel client.
///
/// Sending never blocks and never fails loudly: when the channel is not open
/// the envelope is dropped with a logged diagnostic and `false` is returned.
/// A `true` return only means the envelope was queued, not delivered.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
    status: watch::Receiver<ChannelStatus>,
}

impl Outbox {
    pub fn send(&self, event: &Event) -> bool {
        self.send_envelope(event.to_envelope())
    }

    pub fn send_raw(&self, kind: &str, data: Value) -> bool {
        self.send_envelope(Envelope::new(kind, data))
    }

    pub fn send_envelope(&self, envelope: Envelope) -> bool {
        let state = self.status.borrow().state;
        if state != ConnectionState::Open {
            warn!(event = %envelope.kind, %state, "channel not open, dropping outgoing message");
            return false;
        }
        if self.tx.send(envelope).is_err() {
            warn!("channel client gone, dropping outgoing message");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").field("status", &*self.status.borrow()).finish()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ActiveConnection {
    endpoint: Endpoint,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// One logical connection per room and role.
pub struct ChannelClient<C: Connector> {
    connector: Arc<C>,
    base_url: String,
    options: ChannelOptions,
    dispatcher: Dispatcher,
    status: Arc<watch::Sender<ChannelStatus>>,
    outbox_tx: mpsc::UnboundedSender<Envelope>,
    outbox_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
    active: Option<ActiveConnection>,
}

impl<C: Connector> ChannelClient<C> {
    pub fn new(connector: C, base_url: impl Into<String>, options: ChannelOptions) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(connector),
            base_url: base_url.into(),
            options,
            dispatcher: Dispatcher::new(),
            status: Arc::new(status),
            outbox_tx,
            outbox_rx: Arc::new(AsyncMutex::new(outbox_rx)),
            active: None,
        }
    }

    /// The dispatcher incoming events are delivered through.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn outbox(&self) -> Outbox {
        Outbox { tx: self.outbox_tx.clone(), status: self.status.subscribe() }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.active.as_ref().map(|a| &a.endpoint)
    }

    /// Queue an event for the current connection. See [`Outbox::send`].
    pub fn send(&self, event: &Event) -> bool {
        self.outbox().send(event)
    }

    /// Queue a raw envelope with the current timestamp.
    pub fn send_raw(&self, kind: &str, data: Value) -> bool {
        self.outbox().send_raw(kind, data)
    }

    /// Open the connection for `room_id` as `role`.
    ///
    /// A live connection to the same room and role is kept as is; any other
    /// connection is closed first. Returns once the connection task is
    /// running; watch [`Self::watch_status`] for `Open`.
    pub async fn connect(&mut self, room_id: &str, role: PeerRole) {
        let endpoint = Endpoint {
            base_url: self.base_url.clone(),
            room_id: room_id.to_string(),
            role,
        };
        if let Some(active) = &self.active {
            if active.endpoint == endpoint && !active.task.is_finished() {
                debug!(room_id, %role, "already connected");
                return;
            }
        }
        self.teardown().await;

        info!(room_id, %role, "connecting channel");
        self.status.send_replace(ChannelStatus {
            state: ConnectionState::Connecting,
            failures: 0,
            gave_up: false,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = ConnectionTask {
            connector: Arc::clone(&self.connector),
            endpoint: endpoint.clone(),
            options: self.options,
            dispatcher: self.dispatcher.clone(),
            status: Arc::clone(&self.status),
            outbox: Arc::clone(&self.outbox_rx),
        };
        let handle = tokio::spawn(task.run(shutdown_rx));
        self.active = Some(ActiveConnection {
            endpoint,
            shutdown: Some(shutdown_tx),
            task: handle,
        });
    }

    /// Close the connection, cancel any pending reconnect, drop every
    /// subscription and release the transport.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
        self.dispatcher.clear();
        self.status.send_replace(ChannelStatus::default());
        info!("channel disconnected");
    }

    async fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.status.send_modify(|s| s.state = ConnectionState::Closing);
        if let Some(tx) = active.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(self.options.shutdown_timeout, &mut active.task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => warn!("connection task ended abnormally: {join_err}"),
            Err(_) => {
                warn!("connection task did not stop in time; aborting");
                active.task.abort();
            }
        }
    }
}

impl<C: Connector> Drop for ChannelClient<C> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

impl<C: Connector> std::fmt::Debug for ChannelClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("base_url", &self.base_url)
            .field("status", &self.status())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum PumpExit {
    Shutdown,
    Lost(ConnectionError),
}

struct ConnectionTask<C: Connector> {
    connector: Arc<C>,
    endpoint: Endpoint,
    options: ChannelOptions,
    dispatcher: Dispatcher,
    status: Arc<watch::Sender<ChannelStatus>>,
    outbox: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl<C: Connector> ConnectionTask<C> {
    fn set_state(&self, state: ConnectionState, failures: u32) {
        self.status.send_replace(ChannelStatus { state, failures, gave_up: false });
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut outbox = self.outbox.lock().await;
        while let Ok(stale) = outbox.try_recv() {
            debug!(event = %stale.kind, "discarding message queued for a previous connection");
        }

        let room_id = self.endpoint.room_id.as_str();
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting, failures);
            let connected = tokio::select! {
                _ = &mut shutdown => return,
                res = self.connector.connect(&self.endpoint) => res,
            };

            match connected {
                Ok(mut transport) => {
                    failures = 0;
                    self.set_state(ConnectionState::Open, 0);
                    info!(room_id, role = %self.endpoint.role, "channel open");
                    match self.pump(&mut transport, &mut outbox, &mut shutdown).await {
                        PumpExit::Shutdown => {
                            if let Err(e) = transport.close().await {
                                debug!(error = %e, "transport close failed");
                            }
                            return;
                        }
                        PumpExit::Lost(e) => warn!(room_id, error = %e, "connection lost"),
                    }
                }
                Err(e) => warn!(room_id, error = %e, failures, "connect failed"),
            }

            failures = failures.saturating_add(1);
            let Some(delay) = self.options.reconnect.delay_for(failures) else {
                error!(room_id, failures, "reconnect attempts exhausted, giving up");
                self.status.send_replace(ChannelStatus {
                    state: ConnectionState::Disconnected,
                    failures,
                    gave_up: true,
                });
                return;
            };
            self.set_state(ConnectionState::Disconnected, failures);
            info!(room_id, attempt = failures, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &self,
        transport: &mut C::Transport,
        outbox: &mut mpsc::UnboundedReceiver<Envelope>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> PumpExit {
        let mut heartbeat = self.options.heartbeat.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                _ = &mut *shutdown => return PumpExit::Shutdown,

                outgoing = outbox.recv() => {
                    let Some(envelope) = outgoing else {
                        return PumpExit::Shutdown;
                    };
                    match envelope.to_text() {
                        Ok(text) => {
                            if let Err(e) = transport.send(text).await {
                                return PumpExit::Lost(e);
                            }
                        }
                        Err(e) => error!(event = %envelope.kind, error = %e, "failed to encode envelope"),
                    }
                }

                incoming = transport.recv() => match incoming {
                    Some(Ok(text)) => handle_frame(&self.dispatcher, &text),
                    Some(Err(e)) => return PumpExit::Lost(e),
                    None => return PumpExit::Lost(ConnectionError::Closed),
                },

                _ = next_tick(heartbeat.as_mut()) => {
                    if let Ok(text) = Event::Ping.to_envelope().to_text() {
                        if let Err(e) = transport.send(text).await {
                            return PumpExit::Lost(e);
                        }
                    }
                }
            }
        }
    }
}

async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Decode one frame and fan it out. Bad frames are dropped, never fatal.
fn handle_frame(dispatcher: &Dispatcher, text: &str) {
    let envelope = match Envelope::from_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return;
        }
    };
    if let Err(e) = dispatcher.dispatch(&envelope) {
        warn!(event = %envelope.kind, error = %e, "dropping undecodable envelope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Some(1))]
    #[case(2, Some(2))]
    #[case(3, Some(4))]
    #[case(5, Some(16))]
    #[case(6, None)]
    #[case(0, None)]
    fn test_default_policy_delays(#[case] attempt: u32, #[case] secs: Option<u64>) {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(attempt), secs.map(Duration::from_secs));
    }

    #[test]
    fn test_policy_caps_at_max_delay() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 40,
        };
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(40), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_attempts_never_reconnects() {
        let policy = ReconnectPolicy { max_attempts: 0, ..ReconnectPolicy::default() };
        assert_eq!(policy.delay_for(1), None);
    }

    #[test]
    fn test_endpoint_url_has_room_and_role() {
        let ep = Endpoint {
            base_url: "ws://127.0.0.1:8031/ws".into(),
            room_id: "room 1".into(),
            role: PeerRole::Viewer,
        };
        assert_eq!(ep.url().unwrap(), "ws://127.0.0.1:8031/ws?room_id=room+1&role=viewer");
    }

    #[test]
    fn test_endpoint_bad_base_url() {
        let ep = Endpoint { base_url: "not a url".into(), room_id: "r".into(), role: PeerRole::Streamer };
        assert!(matches!(ep.url(), Err(ConnectionError::InvalidUrl { .. })));
    }

    #[test]
    fn test_status_reconnecting_flag() {
        let s = ChannelStatus { state: ConnectionState::Connecting, failures: 2, gave_up: false };
        assert!(s.is_reconnecting());
        let s = ChannelStatus { gave_up: true, ..s };
        assert!(!s.is_reconnecting());
    }

    #[test]
    fn test_handle_frame_survives_garbage() {
        let d = Dispatcher::new();
        handle_frame(&d, "{{{");
        handle_frame(&d, r#"{"type":"mystery","data":{}}"#);
        handle_frame(&d, r#"{"type":"room:viewer_count","data":{"count":-1}}"#);
    }
}
