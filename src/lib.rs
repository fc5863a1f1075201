//! Decentra Client - Kern eines Chat- und Voice-Clients
//!
//! Verbindet sich per WebSocket mit einem Chat-Server und bietet:
//! - Envelope-basiertes Signaling (Chat, Server, Kanäle, Direktnachrichten)
//! - WebRTC 1:1 Anrufe und Voice Channels
//! - Audio Capture/Playback (48kHz, 16 Bit, Mono)

pub mod call_engine;
pub mod chat;
pub mod config;
pub mod signaling;

pub use call_engine::{
    AudioBackend, AudioPipeline, CallEngineError, CallEvent, CallState, CpalBackend,
    PeerConnectionFactory, SignalingCoordinator, VoiceMode, WebRtcPeerFactory,
};
pub use chat::{AuthStatus, ChatState, ChatUpdate};
pub use config::ClientConfig;
pub use signaling::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, Envelope, MessageKind,
};

use parking_lot::{Mutex, RwLock};
use signaling::EventReceiver;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Log-Filter wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_DIRECTIVES: &str = "decentra_client=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfache Aufrufe sind unschädlich.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CLIENT EVENTS
// ============================================================================

/// Events für die Oberfläche
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Chat(ChatUpdate),
}

// ============================================================================
// CLIENT
// ============================================================================

/// Fassade über Verbindung, Anrufe und Chat-Zustand
pub struct Client {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    coordinator: Arc<SignalingCoordinator>,
    chat: Arc<RwLock<ChatState>>,
    event_tx: broadcast::Sender<ClientEvent>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Client mit cpal-Audio und webrtc-rs Peer Connections
    ///
    /// Muss innerhalb einer Tokio-Runtime erzeugt werden.
    pub fn new(config: ClientConfig) -> Self {
        let factory = Arc::new(WebRtcPeerFactory::new(&config.ice_servers));
        let backend = Arc::new(CpalBackend::new());
        Self::with_parts(config, factory, backend)
    }

    /// Client mit austauschbaren Peer- und Audio-Implementierungen
    pub fn with_parts(
        config: ClientConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(&config));
        let audio = Arc::new(AudioPipeline::new(backend));
        let coordinator = Arc::new(SignalingCoordinator::new(
            connection.clone(),
            factory,
            audio,
            &config,
        ));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            connection,
            coordinator,
            chat: Arc::new(RwLock::new(ChatState::new())),
            event_tx,
            router: Mutex::new(None),
        }
    }

    /// Startet das Routing und verbindet mit dem konfigurierten Server
    pub async fn start(&self) {
        self.ensure_router();
        self.connection.connect(&self.config.server_url).await;
    }

    /// Trennt die Verbindung, laufende Anrufe bleiben bestehen
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.coordinator.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn coordinator(&self) -> &Arc<SignalingCoordinator> {
        &self.coordinator
    }

    /// Lesezugriff auf den Chat-Zustand
    pub fn with_chat<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.chat.read())
    }

    // ========================================================================
    // ACCOUNT & CHAT
    // ========================================================================

    pub async fn login(&self, username: &str, password: &str) {
        self.chat.write().begin_auth(username);
        self.connection
            .send(&Envelope::auth(username, password))
            .await;
    }

    pub async fn signup(&self, username: &str, password: &str, invite_code: &str) {
        self.chat.write().begin_auth(username);
        self.connection
            .send(&Envelope::signup(username, password, invite_code))
            .await;
    }

    /// Sendet eine Chat-Nachricht in den aktuellen Kontext
    pub async fn send_chat(&self, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        self.connection.send(&Envelope::chat(content)).await;
    }

    pub async fn switch_server(&self, server_id: &str) {
        self.chat.write().select_server(server_id);
        self.connection
            .send(&Envelope::switch_server(server_id))
            .await;
    }

    pub async fn switch_channel(&self, channel_id: &str) {
        self.chat.write().select_channel(channel_id);
        self.connection
            .send(&Envelope::switch_channel(channel_id))
            .await;
    }

    pub async fn switch_dm(&self, dm_id: &str) {
        self.chat.write().select_dm(dm_id);
        self.connection.send(&Envelope::switch_dm(dm_id)).await;
    }

    pub async fn create_server(&self, name: &str) {
        if name.trim().is_empty() {
            return;
        }
        self.connection.send(&Envelope::create_server(name)).await;
    }

    // ========================================================================
    // VOICE
    // ========================================================================

    pub async fn call_user(&self, username: &str) {
        self.coordinator.call_user(username).await;
    }

    pub async fn hang_up(&self) {
        self.coordinator.hang_up().await;
    }

    pub async fn hang_up_peer(&self, username: &str) {
        self.coordinator.hang_up_peer(username).await;
    }

    pub async fn join_voice(&self, server_id: &str, channel_id: &str) {
        self.coordinator
            .join_voice_channel(server_id, channel_id)
            .await;
    }

    /// Tritt dem gewählten Kanal bei, sofern er ein Voice Channel ist
    pub async fn join_current_voice_channel(&self) -> bool {
        let target = self.with_chat(|chat| {
            let server_id = chat.current_server.clone()?;
            let channel = chat.selected_channel().filter(|c| c.is_voice())?;
            Some((server_id, channel.channel_id.clone()))
        });

        match target {
            Some((server_id, channel_id)) => {
                self.join_voice(&server_id, &channel_id).await;
                true
            }
            None => {
                tracing::warn!("No voice channel selected");
                false
            }
        }
    }

    pub async fn leave_voice(&self) {
        self.coordinator.leave_voice_channel().await;
    }

    pub fn set_muted(&self, muted: bool) {
        self.coordinator.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.coordinator.is_muted()
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.coordinator.set_deafened(deafened);
    }

    pub fn is_deafened(&self) -> bool {
        self.coordinator.is_deafened()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_router(&self) {
        let mut router = self.router.lock();
        if router.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let events = self.connection.subscribe();
        *router = Some(tokio::spawn(route_events(
            events,
            Arc::clone(&self.chat),
            Arc::clone(&self.coordinator),
            self.event_tx.clone(),
        )));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_url", &self.config.server_url)
            .field("connection", &self.connection.state())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

// ============================================================================
// EVENT ROUTER
// ============================================================================

/// Verarbeitet Verbindungs-Events in Empfangsreihenfolge
async fn route_events(
    mut events: EventReceiver,
    chat: Arc<RwLock<ChatState>>,
    coordinator: Arc<SignalingCoordinator>,
    event_tx: broadcast::Sender<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => {
                tracing::info!("Connected to chat server");
                let _ = event_tx.send(ClientEvent::Connected);
            }

            ConnectionEvent::Disconnected => {
                tracing::info!("Disconnected from chat server");
                let _ = event_tx.send(ClientEvent::Disconnected);
            }

            ConnectionEvent::MessageReceived(envelope) => {
                route_envelope(envelope, &chat, &coordinator, &event_tx).await;
            }
        }
    }
}

/// Leitet Signaling an den Coordinator, alles andere an den Chat-Zustand
async fn route_envelope(
    envelope: Envelope,
    chat: &RwLock<ChatState>,
    coordinator: &SignalingCoordinator,
    event_tx: &broadcast::Sender<ClientEvent>,
) {
    let kind = envelope.kind();
    if kind.is_signaling() {
        let from = match envelope.sender() {
            Some(from) => from.to_string(),
            None => {
                tracing::warn!("Ignoring {} without sender", kind);
                return;
            }
        };

        match (kind, envelope) {
            (MessageKind::WebrtcOffer, Envelope { offer: Some(offer), .. }) => {
                tracing::info!("Incoming call from {}", from);
                coordinator.handle_offer(&from, offer).await;
            }
            (MessageKind::WebrtcAnswer, Envelope { answer: Some(answer), .. }) => {
                coordinator.handle_answer(&from, answer).await;
            }
            (
                MessageKind::WebrtcIce,
                Envelope {
                    candidate: Some(candidate),
                    ..
                },
            ) => {
                coordinator.handle_ice_candidate(&from, candidate).await;
            }
            (kind, _) => tracing::warn!("Ignoring {} from {} without payload", kind, from),
        }
        return;
    }

    let update = chat.write().apply(&envelope);
    match update {
        Some(update) => {
            let _ = event_tx.send(ClientEvent::Chat(update));
        }
        None => tracing::debug!("No state change for '{}'", envelope.msg_type),
    }
}
