//! WebSocket Client für den Chat-Server
//!
//! Verwaltet genau eine WebSocket-Verbindung:
//! - Verbindungsaufbau mit Timeout
//! - Serialisierung ausgehender Envelopes (fire-and-forget)
//! - Empfangs-Loop mit Cancellation und Keep-Alive Pings
//! - Event-Verteilung an alle Subscriber in Empfangsreihenfolge

use super::messages::{Envelope, EnvelopeError};
use crate::config::ClientConfig;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Empfänger für Verbindungs-Events
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("WebSocket connection failed: {0}")]
    ConnectFailed(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to server")]
    NotConnected,

    #[error("Failed to decode envelope: {0}")]
    Decode(#[from] EnvelopeError),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Lebenszyklus der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events die vom ConnectionManager ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Verbunden mit dem Server
    Connected,

    /// Verbindung getrennt (lokal, durch den Server oder durch einen I/O-Fehler)
    Disconnected,

    /// Envelope empfangen
    MessageReceived(Envelope),
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

/// Observer-Registry: jeder Subscriber bekommt jedes Event genau einmal
#[derive(Default)]
struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl Subscribers {
    fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Liefert synchron an alle Subscriber aus, geschlossene werden entfernt
    fn publish(&self, event: ConnectionEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.senders.lock().len()
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Debug)]
struct ClientState {
    state: ConnectionState,
    /// Wird pro Verbindungsversuch erhöht, alte Receive-Loops erkennen daran
    /// dass sie nicht mehr zuständig sind
    generation: u64,
    cancel: Option<CancellationToken>,
    url: Option<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            cancel: None,
            url: None,
        }
    }
}

/// Von Manager und Receive-Loop gemeinsam genutzt
struct Shared {
    state: RwLock<ClientState>,
    sink: tokio::sync::Mutex<Option<(u64, WsSink)>>,
    subscribers: Subscribers,
}

impl Shared {
    /// Connected → Disconnected, feuert das Event nur beim ersten Aufruf
    /// pro Verbindung
    fn mark_disconnected(&self, generation: u64) -> bool {
        let cancel = {
            let mut state = self.state.write();
            if state.generation != generation || state.state != ConnectionState::Connected {
                return false;
            }
            state.state = ConnectionState::Disconnected;
            state.cancel.take()
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.subscribers.publish(ConnectionEvent::Disconnected);
        true
    }

    /// Räumt nach einem Verbindungsabbruch auf
    async fn teardown(&self, generation: u64) {
        if self.mark_disconnected(generation) {
            tracing::info!("Disconnected from server");
        }

        let mut sink = self.sink.lock().await;
        if matches!(sink.as_ref(), Some((g, _)) if *g == generation) {
            *sink = None;
        }
    }

    async fn send_ping(&self, generation: u64) {
        let mut sink = self.sink.lock().await;
        if let Some((g, write)) = sink.as_mut() {
            if *g == generation {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    tracing::warn!("Failed to send keep-alive ping: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Besitzt die einzige WebSocket-Verbindung des Prozesses
pub struct ConnectionManager {
    shared: Arc<Shared>,
    connect_timeout: Duration,
    keepalive_interval: Option<Duration>,
}

impl ConnectionManager {
    /// Erstellt einen neuen, nicht verbundenen ConnectionManager
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ClientState::default()),
                sink: tokio::sync::Mutex::new(None),
                subscribers: Subscribers::default(),
            }),
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
        }
    }

    /// Gibt einen Event-Receiver zurück
    ///
    /// Events kommen in Empfangsreihenfolge an. Wird der Receiver gedroppt,
    /// fällt der Subscriber beim nächsten Event aus der Registry.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.subscribers.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().state
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// URL der aktuellen bzw. letzten Verbindung
    pub fn server_url(&self) -> Option<String> {
        self.shared.state.read().url.clone()
    }

    /// Verbindet mit dem Server
    ///
    /// Fehler werden geloggt, nicht zurückgegeben. Läuft bereits ein
    /// Verbindungsaufbau oder besteht eine Verbindung, passiert nichts.
    pub async fn connect(&self, url: &str) {
        if let Err(e) = self.try_connect(url).await {
            tracing::error!("WebSocket connection error: {}", e);
        }
    }

    /// Wie [`connect`](Self::connect), gibt aber den Fehler zurück
    pub async fn try_connect(&self, url: &str) -> Result<(), ConnectionError> {
        let url = websocket_url(url)?;
        let url = url.as_str();

        let generation = {
            let mut state = self.shared.state.write();
            if state.state != ConnectionState::Disconnected {
                tracing::info!("Connect ignored, connection is {:?}", state.state);
                return Ok(());
            }
            state.state = ConnectionState::Connecting;
            state.generation += 1;
            state.generation
        };

        tracing::info!("Connecting to server: {}", url);

        let result = tokio::time::timeout(self.connect_timeout, connect_async(url)).await;
        let ws_stream = match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.abort_connecting(generation);
                return Err(ConnectionError::ConnectFailed(e.to_string()));
            }
            Err(_) => {
                self.abort_connecting(generation);
                return Err(ConnectionError::Timeout(self.connect_timeout));
            }
        };

        let (write, read) = ws_stream.split();
        *self.shared.sink.lock().await = Some((generation, write));

        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.write();
            state.state = ConnectionState::Connected;
            state.cancel = Some(cancel.clone());
            state.url = Some(url.to_string());
        }

        tracing::info!("Connected to {}", url);
        self.shared.subscribers.publish(ConnectionEvent::Connected);

        tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            read,
            cancel,
            generation,
            self.keepalive_interval,
        ));

        Ok(())
    }

    /// Sendet ein Envelope als eine Textnachricht
    ///
    /// Ohne Verbindung wird die Nachricht verworfen und der Fehler geloggt.
    /// Es gibt keine Queue und keinen Retry.
    pub async fn send(&self, envelope: &Envelope) {
        if let Err(e) = self.try_send(envelope).await {
            tracing::warn!("Dropping outbound '{}': {}", envelope.msg_type, e);
        }
    }

    /// Wie [`send`](Self::send), gibt aber den Fehler zurück
    pub async fn try_send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let generation = {
            let state = self.shared.state.read();
            if state.state != ConnectionState::Connected {
                return Err(ConnectionError::NotConnected);
            }
            state.generation
        };

        let text = envelope
            .encode()
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;

        let result = {
            let mut sink = self.shared.sink.lock().await;
            match sink.as_mut() {
                Some((g, write)) if *g == generation => write.send(Message::Text(text)).await,
                _ => return Err(ConnectionError::NotConnected),
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!("Sent '{}'", envelope.msg_type);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to send WebSocket message: {}", e);
                self.shared.teardown(generation).await;
                Err(ConnectionError::Transport(e.to_string()))
            }
        }
    }

    /// Trennt die Verbindung mit einem Normal-Closure Frame
    pub async fn disconnect(&self) {
        let (generation, cancel) = {
            let state = self.shared.state.read();
            if state.state != ConnectionState::Connected {
                tracing::debug!("Disconnect ignored, connection is {:?}", state.state);
                return;
            }
            (state.generation, state.cancel.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let sink = {
            let mut sink = self.shared.sink.lock().await;
            match sink.take() {
                Some((g, write)) if g == generation => Some(write),
                other => {
                    *sink = other;
                    None
                }
            }
        };

        if let Some(mut write) = sink {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "Client disconnecting".into(),
            };
            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                tracing::debug!("Close frame not delivered: {}", e);
            }
        }

        if self.shared.mark_disconnected(generation) {
            tracing::info!("Disconnected from server");
        }
    }

    fn abort_connecting(&self, generation: u64) {
        let mut state = self.shared.state.write();
        if state.generation == generation && state.state == ConnectionState::Connecting {
            state.state = ConnectionState::Disconnected;
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }
}

/// Abstraktion über den Versandweg für Signaling-Nachrichten
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Best-effort Versand, Fehler werden vom Sink geloggt
    async fn send_envelope(&self, envelope: Envelope);
}

#[async_trait]
impl EnvelopeSink for ConnectionManager {
    async fn send_envelope(&self, envelope: Envelope) {
        self.send(&envelope).await;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.shared.state.read())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

// ============================================================================
// RECEIVE LOOP
// ============================================================================

/// Prüft die Server-URL, http(s) wird auf ws(s) abgebildet
fn websocket_url(raw: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| ConnectionError::InvalidUrl(raw.to_string()))?;
    }

    Ok(url)
}

/// Liest Frames bis Close, Fehler oder Cancellation
async fn receive_loop(
    shared: Arc<Shared>,
    mut read: WsSource,
    cancel: CancellationToken,
    generation: u64,
    keepalive_interval: Option<Duration>,
) {
    let mut keepalive = keepalive_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Receive loop cancelled");
                return;
            }

            _ = next_tick(&mut keepalive) => {
                shared.send_ping(generation).await;
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                        Ok(envelope) => {
                            tracing::debug!("Received '{}'", envelope.msg_type);
                            shared
                                .subscribers
                                .publish(ConnectionEvent::MessageReceived(envelope));
                        }
                        Err(e) => {
                            tracing::warn!("Dropping undecodable message: {}", e);
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    shared.teardown(generation).await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    type ServerWs = WebSocketStream<TcpStream>;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ClientConfig {
        ClientConfig {
            keepalive_interval: None,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Startet einen Loopback-Server der genau eine Verbindung annimmt
    async fn spawn_server<F, Fut>(handler: F) -> (String, JoinHandle<()>)
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        (format!("ws://{}/ws", addr), handle)
    }

    async fn drain(mut ws: ServerWs) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    async fn next_event(rx: &mut EventReceiver) -> ConnectionEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    async fn assert_no_event(rx: &mut EventReceiver) {
        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (url, _server) = spawn_server(drain).await;
        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();

        manager.connect(&url).await;
        manager.connect(&url).await;

        assert!(manager.is_connected());
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_no_event(&mut events).await;
        assert_eq!(manager.server_url().as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn test_send_transmits_single_text_frame() {
        let (frame_tx, frame_rx) = oneshot::channel();
        let (url, _server) = spawn_server(|mut ws| async move {
            if let Some(Ok(msg)) = ws.next().await {
                let _ = frame_tx.send(msg);
            }
            drain(ws).await;
        })
        .await;

        let manager = ConnectionManager::new(&test_config());
        manager.connect(&url).await;
        manager
            .try_send(&Envelope::auth("alice", "pw"))
            .await
            .unwrap();

        let frame = timeout(WAIT, frame_rx).await.unwrap().unwrap();
        let text = match frame {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "auth", "username": "alice", "password": "pw"})
        );
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let manager = ConnectionManager::new(&test_config());

        let result = manager.try_send(&Envelope::chat("hello")).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));

        // fire-and-forget Variante darf nicht paniken
        manager.send(&Envelope::chat("hello")).await;
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped_in_order() {
        let (url, _server) = spawn_server(|mut ws| async move {
            ws.send(Message::Text("{not json".into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"system","content":"one"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"content":"no type"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"mystery","extra":1}"#.into()))
                .await
                .unwrap();
            drain(ws).await;
        })
        .await;

        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();
        manager.connect(&url).await;

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(env) => {
                assert_eq!(env.msg_type, "system");
                assert_eq!(env.content.as_deref(), Some("one"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(env) => assert_eq!(env.msg_type, "mystery"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_server_close_fires_disconnected_once() {
        let (url, _server) = spawn_server(|mut ws| async move {
            ws.close(None).await.unwrap();
            drain(ws).await;
        })
        .await;

        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();
        manager.connect(&url).await;

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_no_event(&mut events).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Nach dem Abbruch ist Disconnect ein No-op
        manager.disconnect().await;
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn test_disconnect_sends_normal_close() {
        let (close_tx, close_rx) = oneshot::channel();
        let (url, _server) = spawn_server(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = close_tx.send(frame.map(|f| f.code));
                    break;
                }
            }
        })
        .await;

        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();
        manager.connect(&url).await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_no_event(&mut events).await;
        assert!(!manager.is_connected());

        let code = timeout(WAIT, close_rx).await.unwrap().unwrap();
        assert_eq!(code, Some(CloseCode::Normal));
    }

    #[tokio::test]
    async fn test_connect_failure_stays_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();

        let result = manager.try_connect(&format!("ws://{}/ws", addr)).await;
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn test_connect_timeout_stays_disconnected() {
        // TCP wird angenommen, der Handshake aber nie beantwortet
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(WAIT).await;
            drop(stream);
        });

        let config = ClientConfig {
            connect_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let manager = ConnectionManager::new(&config);
        let mut events = manager.subscribe();

        let result = manager.try_connect(&format!("ws://{}/ws", addr)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(d)) if d == Duration::from_millis(50)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn test_keepalive_sends_ping() {
        let (ping_tx, ping_rx) = oneshot::channel();
        let (url, _server) = spawn_server(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Ping(_) = msg {
                    let _ = ping_tx.send(());
                    break;
                }
            }
            drain(ws).await;
        })
        .await;

        let config = ClientConfig {
            keepalive_interval: Some(Duration::from_millis(20)),
            ..test_config()
        };
        let manager = ConnectionManager::new(&config);
        manager.connect(&url).await;

        timeout(WAIT, ping_rx).await.unwrap().unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_server_drop_disconnects_once() {
        let (url, _server) = spawn_server(|ws| async move { drop(ws) }).await;
        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();
        manager.connect(&url).await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        // Je nach Timing bemerkt zuerst try_send oder der Receive Loop den Abbruch
        let mut error = None;
        for _ in 0..100 {
            match manager.try_send(&Envelope::chat("ping")).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(
            error,
            Some(ConnectionError::Transport(_)) | Some(ConnectionError::NotConnected)
        ));

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_no_event(&mut events).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.try_send(&Envelope::chat("late")).await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("ws://localhost:8765/ws").unwrap().as_str(),
            "ws://localhost:8765/ws"
        );
        assert_eq!(
            websocket_url("https://chat.example.org/ws").unwrap().as_str(),
            "wss://chat.example.org/ws"
        );
        assert!(matches!(
            websocket_url("ftp://example.org"),
            Err(ConnectionError::InvalidUrl(_))
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_stays_disconnected() {
        let manager = ConnectionManager::new(&test_config());
        let result = manager.try_connect("localhost:8765").await;
        assert!(result.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_drop() {
        let (url, _server) = spawn_server(|ws| async move { drop(ws) }).await;
        let manager = ConnectionManager::new(&test_config());
        let mut events = manager.subscribe();

        manager.connect(&url).await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);

        let (url, _server) = spawn_server(drain).await;
        manager.connect(&url).await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let (url, _server) = spawn_server(drain).await;
        let manager = ConnectionManager::new(&test_config());

        let kept = manager.subscribe();
        drop(manager.subscribe());
        assert_eq!(manager.subscriber_count(), 2);

        manager.connect(&url).await;
        assert_eq!(manager.subscriber_count(), 1);
        drop(kept);
    }
}
