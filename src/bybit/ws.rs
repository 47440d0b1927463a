//! Bybit v5 websocket session
//!
//! One [`WsSession`] drives one stream (public, private or trade). The
//! session owns the socket inside a single task: heartbeats, topic dispatch,
//! auth and reconnect-with-resubscribe all live in that task's select loop,
//! so a reconnect can never leave a second heartbeat timer running.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::sign;
use crate::config::KeyPair;
use crate::error::SessionFault;

// ============================================================================
// Endpoints and timing
// ============================================================================

pub const MAINNET_PUBLIC_WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
pub const MAINNET_PRIVATE_WS_URL: &str = "wss://stream.bybit.com/v5/private";
pub const MAINNET_TRADE_WS_URL: &str = "wss://stream.bybit.com/v5/trade";

pub const TESTNET_PUBLIC_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/spot";
pub const TESTNET_PRIVATE_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/private";
pub const TESTNET_TRADE_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/trade";

/// Validity window for the auth challenge expiry.
const AUTH_EXPIRES_MS: i64 = 10_000;

/// Heartbeat and reconnect cadence.
#[derive(Debug, Clone, Copy)]
pub struct WsTiming {
    /// Application-level ping cadence while the stream is idle.
    pub ping_interval: Duration,
    /// How long a ping may go unanswered before the connection is torn down.
    pub pong_bound: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for WsTiming {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_bound: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Public surface
// ============================================================================

/// Callback invoked with every push frame for a subscribed topic.
pub type TopicHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Authenticating,
    /// Connected and, where required, authenticated. Sends are accepted.
    Ready,
    Closing,
    /// Lost the connection; the session task is waiting to redial.
    ReconnectWait,
}

/// Lifecycle notifications surfaced to the owner of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Open,
    Authenticated,
    Error(String),
    Reconnecting,
    Closed { initiated: bool },
}

enum Command {
    Send(Value),
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

struct Shared {
    state: Mutex<SessionState>,
    handlers: Mutex<HashMap<String, TopicHandler>>,
}

/// Handle to one websocket stream.
pub struct WsSession {
    label: &'static str,
    url: String,
    auth: Option<KeyPair>,
    timing: WsTiming,
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl WsSession {
    /// Create a session for `url`. `auth` is `None` for public streams.
    /// Returns the session plus the receiver for its lifecycle events.
    pub fn new(
        label: &'static str,
        url: impl Into<String>,
        auth: Option<KeyPair>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::with_timing(label, url, auth, WsTiming::default())
    }

    /// [`new`](Self::new) with explicit heartbeat/reconnect cadence.
    pub fn with_timing(
        label: &'static str,
        url: impl Into<String>,
        auth: Option<KeyPair>,
        timing: WsTiming,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Self {
            label,
            url: url.into(),
            auth,
            timing,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Closed),
                handlers: Mutex::new(HashMap::new()),
            }),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            event_tx,
        };
        (session, event_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    /// Dial, authenticate, and spawn the session task. Errors if the session
    /// is not closed, or if the initial dial/auth fails; reconnects after
    /// that are handled internally.
    pub async fn open(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Closed {
                return Err(anyhow!("{} session already open", self.label));
            }
            *state = SessionState::Opening;
        }
        let command_rx = self
            .command_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("{} session task already spawned", self.label))?;

        let socket = match establish(self.label, &self.url, self.auth.as_ref(), &self.shared).await
        {
            Ok(socket) => socket,
            Err(e) => {
                *self.shared.state.lock().unwrap() = SessionState::Closed;
                return Err(e);
            }
        };
        let _ = self.event_tx.send(SessionEvent::Open);
        if self.auth.is_some() {
            let _ = self.event_tx.send(SessionEvent::Authenticated);
        }
        *self.shared.state.lock().unwrap() = SessionState::Ready;
        info!("{} stream ready", self.label);

        let task = SessionTask {
            label: self.label,
            url: self.url.clone(),
            auth: self.auth.clone(),
            timing: self.timing,
            shared: Arc::clone(&self.shared),
            event_tx: self.event_tx.clone(),
            command_rx,
        };
        tokio::spawn(task.run(socket));
        Ok(())
    }

    /// Register `handler` for `topic` and subscribe. Handlers persist across
    /// reconnects; the session task replays every registered topic after
    /// redialing.
    pub fn subscribe(&self, topic: &str, handler: TopicHandler) {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), handler);
        let _ = self.command_tx.send(Command::Subscribe(topic.to_string()));
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.shared.handlers.lock().unwrap().remove(topic);
        let _ = self.command_tx.send(Command::Unsubscribe(topic.to_string()));
    }

    /// Queue a frame for transmission. A send while the stream is not ready
    /// is dropped and reported as a [`SessionEvent::Error`].
    pub fn send(&self, frame: Value) {
        if self.state() != SessionState::Ready {
            let _ = self.event_tx.send(SessionEvent::Error(format!(
                "{} send dropped: stream not ready",
                self.label
            )));
            return;
        }
        let _ = self.command_tx.send(Command::Send(frame));
    }

    /// Initiate a clean shutdown.
    pub fn close(&self) {
        *self.shared.state.lock().unwrap() = SessionState::Closing;
        let _ = self.command_tx.send(Command::Close);
    }

    // ------------------------------------------------------------------
    // Trade-stream frames
    // ------------------------------------------------------------------

    pub fn create_order(&self, order: Value) {
        self.send(trade_frame("order.create", order));
    }

    pub fn amend_order(&self, amendment: Value) {
        self.send(trade_frame("order.amend", amendment));
    }

    pub fn cancel_order(&self, cancellation: Value) {
        self.send(trade_frame("order.cancel", cancellation));
    }
}

fn trade_frame(op: &str, args: Value) -> Value {
    json!({
        "header": { "X-BAPI-TIMESTAMP": Utc::now().timestamp_millis().to_string() },
        "op": op,
        "args": [args],
    })
}

// ============================================================================
// Connection establishment
// ============================================================================

/// Dial the endpoint and run the auth handshake when credentials are present.
async fn establish(
    label: &str,
    url: &str,
    auth: Option<&KeyPair>,
    shared: &Arc<Shared>,
) -> Result<WsStream> {
    debug!("Connecting {label} stream to {url}");
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| SessionFault::Transport(format!("{label} connect failed: {e}")))?;

    if let Some(keys) = auth {
        *shared.state.lock().unwrap() = SessionState::Authenticating;
        let expires = Utc::now().timestamp_millis() + AUTH_EXPIRES_MS;
        let signature = sign::ws_auth_challenge(&keys.api_secret, expires);
        let frame = json!({
            "op": "auth",
            "args": [keys.api_key, expires, signature],
        });
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| SessionFault::Transport(format!("{label} auth send failed: {e}")))?;

        // The auth confirmation is the next op frame; push traffic cannot
        // arrive before a subscription exists.
        loop {
            let msg = socket
                .next()
                .await
                .ok_or_else(|| {
                    SessionFault::Transport(format!("{label} stream closed during auth"))
                })?
                .map_err(|e| {
                    SessionFault::Transport(format!("{label} stream failed during auth: {e}"))
                })?;
            let Message::Text(text) = msg else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if value.get("op").and_then(Value::as_str) == Some("auth") {
                let ok = value
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or_else(|| {
                        value.get("retCode").and_then(Value::as_i64) == Some(0)
                    });
                if !ok {
                    return Err(SessionFault::Auth(format!("{label}: {text}")).into());
                }
                debug!("{label} stream authenticated");
                break;
            }
        }
    }
    Ok(socket)
}

// ============================================================================
// Session task
// ============================================================================

struct SessionTask {
    label: &'static str,
    url: String,
    auth: Option<KeyPair>,
    timing: WsTiming,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl SessionTask {
    async fn run(mut self, mut socket: WsStream) {
        self.replay_subscriptions(&mut socket).await;

        let mut heartbeat = interval(self.timing.ping_interval);
        heartbeat.tick().await; // first tick fires immediately
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Send(frame) => {
                            if self.write(&mut socket, frame).await.is_err() {
                                match self.reconnect(&mut socket, &mut heartbeat, &mut pong_deadline).await {
                                    Ok(()) => continue,
                                    Err(()) => break,
                                }
                            }
                        }
                        Command::Subscribe(topic) => {
                            let frame = json!({ "op": "subscribe", "args": [topic] });
                            let _ = self.write(&mut socket, frame).await;
                        }
                        Command::Unsubscribe(topic) => {
                            let frame = json!({ "op": "unsubscribe", "args": [topic] });
                            let _ = self.write(&mut socket, frame).await;
                        }
                        Command::Close => {
                            let _ = socket.close(None).await;
                            *self.shared.state.lock().unwrap() = SessionState::Closed;
                            let _ = self.event_tx.send(SessionEvent::Closed { initiated: true });
                            info!("{} stream closed", self.label);
                            return;
                        }
                    }
                }

                msg = socket.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_message(msg, &mut heartbeat, &mut pong_deadline),
                        Some(Err(e)) => {
                            warn!("{} stream error: {e}", self.label);
                            match self.reconnect(&mut socket, &mut heartbeat, &mut pong_deadline).await {
                                Ok(()) => continue,
                                Err(()) => break,
                            }
                        }
                        None => {
                            if self.closing() {
                                *self.shared.state.lock().unwrap() = SessionState::Closed;
                                let _ = self.event_tx.send(SessionEvent::Closed { initiated: true });
                                return;
                            }
                            warn!("{} stream closed by peer", self.label);
                            match self.reconnect(&mut socket, &mut heartbeat, &mut pong_deadline).await {
                                Ok(()) => continue,
                                Err(()) => break,
                            }
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.timing.pong_bound);
                    }
                    let frame = json!({ "op": "ping" });
                    if self.write(&mut socket, frame).await.is_err() {
                        match self.reconnect(&mut socket, &mut heartbeat, &mut pong_deadline).await {
                            Ok(()) => continue,
                            Err(()) => break,
                        }
                    }
                }

                _ = async { sleep_until(pong_deadline.unwrap()).await }, if pong_deadline.is_some() => {
                    warn!(
                        "{} ping unanswered for {:?}, reconnecting",
                        self.label, self.timing.pong_bound
                    );
                    if self.reconnect(&mut socket, &mut heartbeat, &mut pong_deadline).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Reached on command-channel loss or when a user close interrupted
        // the reconnect loop; the state still says which one it was.
        let initiated = self.closing();
        *self.shared.state.lock().unwrap() = SessionState::Closed;
        let _ = self.event_tx.send(SessionEvent::Closed { initiated });
    }

    fn closing(&self) -> bool {
        *self.shared.state.lock().unwrap() == SessionState::Closing
    }

    async fn write(&self, socket: &mut WsStream, frame: Value) -> Result<(), ()> {
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| {
                warn!("{} send failed: {e}", self.label);
            })
    }

    fn handle_message(
        &self,
        msg: Message,
        heartbeat: &mut tokio::time::Interval,
        pong_deadline: &mut Option<Instant>,
    ) {
        // Any inbound traffic proves the connection is alive.
        *pong_deadline = None;
        let text = match msg {
            Message::Text(text) => text,
            // A protocol-level ping/pong also re-arms the ping timer.
            Message::Ping(_) | Message::Pong(_) => {
                heartbeat.reset();
                return;
            }
            _ => return,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            debug!("{} dropped unparseable frame", self.label);
            return;
        };

        if let Some(topic) = value.get("topic").and_then(Value::as_str) {
            let handler = self.shared.handlers.lock().unwrap().get(topic).cloned();
            match handler {
                Some(handler) => handler(&value),
                None => debug!("{} push for unknown topic {topic}", self.label),
            }
            return;
        }

        match value.get("op").and_then(Value::as_str) {
            Some("ping") | Some("pong") => heartbeat.reset(),
            Some("subscribe") | Some("unsubscribe") => {
                if value.get("success").and_then(Value::as_bool) == Some(false) {
                    let _ = self.event_tx.send(SessionEvent::Error(format!(
                        "{} subscription rejected: {text}",
                        self.label
                    )));
                }
            }
            _ => {
                // Trade acknowledgements carry a retCode.
                if let Some(code) = value.get("retCode").and_then(Value::as_i64) {
                    if code != 0 {
                        let _ = self.event_tx.send(SessionEvent::Error(format!(
                            "{} request rejected: {text}",
                            self.label
                        )));
                    }
                }
            }
        }
    }

    /// Redial until the endpoint answers, then resubscribe every registered
    /// topic. Only a shutdown initiated through [`WsSession::close`] stops
    /// the retry loop.
    async fn reconnect(
        &mut self,
        socket: &mut WsStream,
        heartbeat: &mut tokio::time::Interval,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), ()> {
        *self.shared.state.lock().unwrap() = SessionState::ReconnectWait;
        let _ = self.event_tx.send(SessionEvent::Reconnecting);
        *pong_deadline = None;

        loop {
            sleep(self.timing.reconnect_delay).await;
            if self.closing() {
                return Err(());
            }
            match establish(self.label, &self.url, self.auth.as_ref(), &self.shared).await {
                Ok(fresh) => {
                    *socket = fresh;
                    break;
                }
                Err(e) => {
                    warn!("{} reconnect failed: {e:#}", self.label);
                    *self.shared.state.lock().unwrap() = SessionState::ReconnectWait;
                }
            }
        }

        *self.shared.state.lock().unwrap() = SessionState::Ready;
        let _ = self.event_tx.send(SessionEvent::Open);
        if self.auth.is_some() {
            let _ = self.event_tx.send(SessionEvent::Authenticated);
        }
        self.replay_subscriptions(socket).await;
        heartbeat.reset();
        info!("{} stream reconnected", self.label);
        Ok(())
    }

    async fn replay_subscriptions(&self, socket: &mut WsStream) {
        let topics: Vec<String> = self
            .shared
            .handlers
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for topic in topics {
            debug!("{} subscribing to {topic}", self.label);
            let frame = json!({ "op": "subscribe", "args": [topic] });
            let _ = self.write(socket, frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_frame_shape() {
        let frame = trade_frame("order.create", json!({ "symbol": "USDCUSDT" }));
        assert_eq!(frame["op"], "order.create");
        assert_eq!(frame["args"][0]["symbol"], "USDCUSDT");
        assert!(frame["header"]["X-BAPI-TIMESTAMP"].is_string());
    }

    #[test]
    fn send_before_open_surfaces_error_event() {
        let (session, mut events) = WsSession::new("test", "wss://unused.invalid", None);
        assert_eq!(session.state(), SessionState::Closed);
        session.send(json!({ "op": "ping" }));
        match events.try_recv() {
            Ok(SessionEvent::Error(msg)) => assert!(msg.contains("not ready")),
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
