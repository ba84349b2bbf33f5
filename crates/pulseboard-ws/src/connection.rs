//! WebSocket client and connection driver.
//!
//! Handles connection lifecycle, automatic reconnection with exponential
//! backoff, outbound buffering while disconnected, and subscription replay
//! after reconnection.
//!
//! A single driver task ([`WsClient::run`]) owns the socket end to end, so at
//! most one live socket and one pending backoff timer exist at any time.
//! `connect()`, `disconnect()`, `send()` and `subscribe()` are cheap control
//! operations callable from any task.

use crate::backoff::ReconnectPolicy;
use crate::envelope::Envelope;
use crate::error::{WsError, WsResult};
use crate::events::{BoxError, EventBus, EventKind, HandlerId, TransportEvent};
use crate::queue::OutboundQueue;
use crate::subscription::SubscriptionRegistry;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Supplies the bearer token appended to the connection URL.
///
/// Token rotation is not watched; a fresh `connect()` re-reads the provider.
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` when no credential is available.
    fn token(&self) -> Option<String>;
}

/// Fixed-token provider for tests and static deployments.
pub struct StaticToken(pub Option<String>);

impl CredentialProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host (and port), without scheme.
    pub host: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// Endpoint path.
    pub path: String,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Attempt ceiling before reconnection is abandoned.
    pub max_reconnect_attempts: u32,
    /// Capacity of the live-send channel into the socket writer.
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8080".to_string(),
            secure: false,
            path: "/api/v1/chat/ws".to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            outbound_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Connection URL with the bearer token attached.
    pub fn endpoint(&self, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{}?token={token}", self.host, self.path)
    }

    /// The backoff policy this config describes.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Point-in-time view of the client, for UI adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<String>,
}

/// Control signals from handles into the driver loop.
#[derive(Debug)]
enum Control {
    Connect,
    Disconnect,
}

/// How a live session ended, as seen by the supervisor.
enum SessionEnd {
    /// Explicit `disconnect()` or shutdown; no reconnect is scheduled.
    Ordered,
    /// Explicit `connect()` while live; retry immediately with a fresh counter.
    Reconnect,
    /// Unexpected close or error; the backoff supervisor takes over.
    Failed,
}

/// Reconnecting, topic-addressed WebSocket transport.
///
/// Create once per session, wrap in an [`Arc`], and spawn [`run`](Self::run)
/// to drive it. All other methods are non-blocking signals or snapshots.
pub struct WsClient {
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    state: Arc<RwLock<ConnectionState>>,
    queue: Arc<OutboundQueue>,
    subscriptions: Arc<SubscriptionRegistry>,
    bus: Arc<EventBus>,
    /// Failed/closed attempts since the last successful open.
    attempts: Arc<RwLock<u32>>,
    /// Live sends into the socket writer; drained only while a session runs.
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: TokioMutex<mpsc::Receiver<String>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: TokioMutex<mpsc::UnboundedReceiver<Control>>,
    shutdown_token: CancellationToken,
}

impl WsClient {
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            credentials,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            queue: Arc::new(OutboundQueue::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            bus: Arc::new(EventBus::new()),
            attempts: Arc::new(RwLock::new(0)),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            control_tx,
            control_rx: TokioMutex::new(control_rx),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Failed attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        *self.attempts.read()
    }

    /// Snapshot of state, attempt counter, and subscriptions.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            subscriptions: self.subscriptions.snapshot(),
        }
    }

    /// Register a lifecycle/event handler. See [`EventBus::on`].
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Register a handler for inbound frames of a given envelope `type`.
    pub fn on_message_kind<F>(&self, message_kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&TransportEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.bus.on_message_kind(message_kind, handler)
    }

    /// Remove a previously registered handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.bus.off(id)
    }

    /// Request a (re)connection.
    ///
    /// Closes any live socket, cancels a pending backoff timer, resets the
    /// attempt counter, and starts a fresh attempt. If the credential
    /// provider has no token the request is a silent no-op.
    pub fn connect(&self) {
        let _ = self.control_tx.send(Control::Connect);
    }

    /// Close the connection and suppress the reconnect supervisor.
    ///
    /// User intent, not failure: no retry is scheduled until the next
    /// explicit `connect()`.
    pub fn disconnect(&self) {
        let _ = self.control_tx.send(Control::Disconnect);
    }

    /// Tear the client down for good; `run()` exits promptly.
    pub fn shutdown(&self) {
        info!("WsClient shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Send an envelope.
    ///
    /// Returns `true` if the client is connected and the frame was handed to
    /// the socket writer. While disconnected the envelope is buffered for the
    /// next successful connection and `false` is returned. A backlogged
    /// writer while connected drops the frame (the buffer is flushed only on
    /// reconnect, so parking it there would strand it behind newer sends).
    /// Best-effort either way: `true` is not a delivery confirmation.
    pub fn send(&self, envelope: &Envelope) -> bool {
        if self.is_connected() {
            match envelope.to_text() {
                Ok(text) => {
                    if self.outbound_tx.try_send(text).is_ok() {
                        return true;
                    }
                    warn!("writer backlogged, dropping envelope");
                }
                Err(e) => warn!(error = %e, "failed to serialize envelope, dropping"),
            }
            return false;
        }
        self.queue.push(envelope.clone());
        false
    }

    /// Subscribe to a topic.
    ///
    /// Adds the topic to the registry and, when connected, sends the
    /// subscribe control message immediately. While disconnected the replay
    /// after the next (re)connection covers it; control traffic is never
    /// buffered in the outbound queue.
    pub fn subscribe(&self, topic: impl Into<String>) -> SubscriptionHandle {
        let topic = topic.into();
        if self.subscriptions.insert(topic.clone()) {
            self.bus.dispatch(&TransportEvent::SubscriptionChanged {
                topic: topic.clone(),
                subscribed: true,
            });
        }
        self.send_control(&Envelope::subscribe(&topic));
        SubscriptionHandle {
            topic,
            state: self.state.clone(),
            subscriptions: self.subscriptions.clone(),
            bus: self.bus.clone(),
            outbound_tx: self.outbound_tx.clone(),
        }
    }

    /// Subscribe to a topic and invoke `callback` for every inbound frame
    /// addressed to it.
    ///
    /// Convenience over [`subscribe`](Self::subscribe) plus a filtered
    /// message handler; the returned handle removes both. Multiple local
    /// listeners of one topic each call this independently (no reference
    /// counting: the last `unsubscribe` wins on the wire).
    pub fn subscribe_with<F>(&self, topic: impl Into<String>, callback: F) -> TopicSubscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let filter = topic.clone();
        let handler_id = self.bus.on(EventKind::Message, move |event| {
            if let TransportEvent::Message { envelope } = event {
                if envelope.topic.as_deref() == Some(filter.as_str()) {
                    callback(envelope);
                }
            }
            Ok(())
        });
        TopicSubscription {
            handle: self.subscribe(topic),
            handler_id,
            bus: self.bus.clone(),
        }
    }

    /// Unsubscribe from a topic.
    pub fn unsubscribe(&self, topic: &str) {
        if self.subscriptions.remove(topic) {
            self.bus.dispatch(&TransportEvent::SubscriptionChanged {
                topic: topic.to_string(),
                subscribed: false,
            });
        }
        self.send_control(&Envelope::unsubscribe(topic));
    }

    /// Current subscription snapshot.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.snapshot()
    }

    fn send_control(&self, envelope: &Envelope) {
        if !self.is_connected() {
            return;
        }
        match envelope.to_text() {
            Ok(text) => {
                if self.outbound_tx.try_send(text).is_err() {
                    debug!("writer unavailable, control frame dropped");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize control frame"),
        }
    }

    /// Drive the connection until shutdown.
    ///
    /// Idles until `connect()` is called, then runs the attempt/backoff loop
    /// described in the module docs. Spawn exactly once per client.
    pub async fn run(&self) {
        let mut control_rx = self.control_rx.lock().await;
        let mut outbound_rx = self.outbound_rx.lock().await;
        let policy = self.config.reconnect_policy();

        loop {
            // Idle until a connect request arrives.
            let ctl = tokio::select! {
                ctl = control_rx.recv() => ctl,
                () = self.shutdown_token.cancelled() => return,
            };
            match ctl {
                Some(Control::Connect) => {}
                Some(Control::Disconnect) => continue,
                None => return,
            }
            *self.attempts.write() = 0;

            'attempts: loop {
                if self.shutdown_token.is_cancelled() {
                    *self.state.write() = ConnectionState::Disconnected;
                    return;
                }

                let Some(token) = self.credentials.token() else {
                    // No credential: stay down until the caller retries.
                    debug!("connect skipped, no credential available");
                    *self.state.write() = ConnectionState::Disconnected;
                    break 'attempts;
                };

                *self.state.write() = ConnectionState::Connecting;
                let url = self.config.endpoint(&token);
                debug!(host = %self.config.host, "opening WebSocket");

                let end = match connect_async(url.as_str()).await {
                    Ok((stream, _response)) => {
                        self.session(stream, &mut control_rx, &mut outbound_rx).await
                    }
                    Err(e) => {
                        warn!(error = %e, "WebSocket open failed");
                        self.bus.dispatch(&TransportEvent::Error {
                            cause: WsError::ConnectionFailed(e.to_string()).to_string(),
                        });
                        SessionEnd::Failed
                    }
                };

                match end {
                    SessionEnd::Ordered => break 'attempts,
                    SessionEnd::Reconnect => {
                        *self.attempts.write() = 0;
                        continue 'attempts;
                    }
                    SessionEnd::Failed => {
                        *self.state.write() = ConnectionState::Disconnected;
                    }
                }

                let attempt = {
                    let mut attempts = self.attempts.write();
                    *attempts += 1;
                    *attempts
                };

                if policy.is_exhausted(attempt) {
                    error!(attempt, "reconnect attempts exhausted");
                    self.bus.dispatch(&TransportEvent::Error {
                        cause: WsError::ReconnectExhausted { attempts: attempt }.to_string(),
                    });
                    break 'attempts;
                }

                let delay = policy.delay_for(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

                // Backoff sleep, cut short by an explicit connect/disconnect.
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    ctl = control_rx.recv() => match ctl {
                        Some(Control::Connect) => {
                            *self.attempts.write() = 0;
                        }
                        Some(Control::Disconnect) => break 'attempts,
                        None => return,
                    },
                    () = self.shutdown_token.cancelled() => {
                        *self.state.write() = ConnectionState::Disconnected;
                        return;
                    }
                }
            }
        }
    }

    /// Run one live socket to completion.
    async fn session(
        &self,
        stream: WsStream,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
        outbound_rx: &mut mpsc::Receiver<String>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Live sends accepted during a previous session died with its socket.
        let mut stale = 0usize;
        while outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped outbound frames from previous session");
        }

        let recovered = {
            let mut attempts = self.attempts.write();
            let prior = *attempts;
            *attempts = 0;
            prior > 0
        };
        *self.state.write() = ConnectionState::Connected;
        info!(host = %self.config.host, recovered, "WebSocket connected");

        if recovered {
            self.bus.dispatch(&TransportEvent::Reconnected);
        }
        self.bus.dispatch(&TransportEvent::Connected);

        // Queue flush first, subscription replay second: buffered application
        // messages must never be reordered behind subscription traffic.
        if let Err(e) = self.flush_queue(&mut write).await {
            warn!(error = %e, "flush failed after connect");
            return self.drop_session(&e.to_string());
        }
        if let Err(e) = self.replay_subscriptions(&mut write).await {
            warn!(error = %e, "subscription replay failed after connect");
            return self.drop_session(&e.to_string());
        }

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    *self.state.write() = ConnectionState::Disconnected;
                    self.bus.dispatch(&TransportEvent::Disconnected);
                    return SessionEnd::Ordered;
                }

                ctl = control_rx.recv() => match ctl {
                    Some(Control::Disconnect) => {
                        *self.state.write() = ConnectionState::Closing;
                        let _ = write.send(Message::Close(None)).await;
                        *self.state.write() = ConnectionState::Disconnected;
                        self.bus.dispatch(&TransportEvent::Disconnected);
                        return SessionEnd::Ordered;
                    }
                    Some(Control::Connect) => {
                        // connect() always tears down the prior socket first.
                        let _ = write.send(Message::Close(None)).await;
                        *self.state.write() = ConnectionState::Disconnected;
                        self.bus.dispatch(&TransportEvent::Disconnected);
                        return SessionEnd::Reconnect;
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        *self.state.write() = ConnectionState::Disconnected;
                        return SessionEnd::Ordered;
                    }
                },

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let cause = frame
                            .map(|f| WsError::ConnectionClosed {
                                code: f.code.into(),
                                reason: f.reason.to_string(),
                            })
                            .unwrap_or(WsError::ConnectionClosed {
                                code: 1000,
                                reason: "normal close".to_string(),
                            })
                            .to_string();
                        warn!(%cause, "WebSocket closed by server");
                        self.bus.dispatch(&TransportEvent::Error { cause: cause.clone() });
                        return self.drop_session(&cause);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket read error");
                        self.bus.dispatch(&TransportEvent::Error { cause: e.to_string() });
                        return self.drop_session(&e.to_string());
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        return self.drop_session("stream ended");
                    }
                    Some(Ok(_)) => {}
                },

                out = outbound_rx.recv() => {
                    if let Some(text) = out {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "WebSocket write failed");
                            return self.drop_session(&e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Unexpected session end: record the state and hand off to the supervisor.
    fn drop_session(&self, reason: &str) -> SessionEnd {
        debug!(%reason, "session dropped");
        *self.state.write() = ConnectionState::Disconnected;
        self.bus.dispatch(&TransportEvent::Disconnected);
        SessionEnd::Failed
    }

    async fn flush_queue(&self, write: &mut WsSink) -> WsResult<()> {
        let mut flushed = 0usize;
        while let Some(envelope) = self.queue.pop() {
            let text = envelope.to_text()?;
            write.send(Message::Text(text)).await?;
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "flushed buffered outbound messages");
        }
        Ok(())
    }

    async fn replay_subscriptions(&self, write: &mut WsSink) -> WsResult<()> {
        let replay = self.subscriptions.replay_messages();
        if replay.is_empty() {
            return Ok(());
        }
        info!(count = replay.len(), "replaying subscriptions");
        for envelope in replay {
            write.send(Message::Text(envelope.to_text()?)).await?;
        }
        Ok(())
    }

    /// Parse an inbound text frame and fan it out. Malformed frames are
    /// logged and dropped; they never affect the connection.
    fn handle_frame(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.bus.dispatch(&TransportEvent::Message { envelope }),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
}

/// Handle returned by [`WsClient::subscribe`].
pub struct SubscriptionHandle {
    topic: String,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<SubscriptionRegistry>,
    bus: Arc<EventBus>,
    outbound_tx: mpsc::Sender<String>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Drop the subscription: removes the topic from the registry and, when
    /// connected, sends the unsubscribe control message.
    pub fn unsubscribe(self) {
        if self.subscriptions.remove(&self.topic) {
            self.bus.dispatch(&TransportEvent::SubscriptionChanged {
                topic: self.topic.clone(),
                subscribed: false,
            });
        }
        if *self.state.read() != ConnectionState::Connected {
            return;
        }
        match Envelope::unsubscribe(&self.topic).to_text() {
            Ok(text) => {
                if self.outbound_tx.try_send(text).is_err() {
                    debug!(topic = %self.topic, "writer unavailable, unsubscribe dropped");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize unsubscribe"),
        }
    }
}

/// Handle returned by [`WsClient::subscribe_with`]; bundles the topic
/// subscription with its message listener.
pub struct TopicSubscription {
    handle: SubscriptionHandle,
    handler_id: HandlerId,
    bus: Arc<EventBus>,
}

impl TopicSubscription {
    pub fn topic(&self) -> &str {
        self.handle.topic()
    }

    /// Remove the listener and drop the subscription.
    pub fn unsubscribe(self) {
        self.bus.off(self.handler_id);
        self.handle.unsubscribe();
    }
}
