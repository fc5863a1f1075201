//! Signaling Coordinator
//!
//! Verwaltet eine Peer Connection pro Gegenstelle und übersetzt zwischen
//! Signaling-Nachrichten und WebRTC. Koordiniert außerdem Audio Capture und
//! Playback für Direktanrufe und Voice Channels.
//!
//! Direktanruf und Voice Channel schließen sich gegenseitig aus, die jeweils
//! letzte Aktion des Benutzers gewinnt.

use super::audio::{AudioError, AudioFrame, AudioPipeline};
use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvents};
use crate::config::ClientConfig;
use crate::signaling::{Envelope, EnvelopeSink, IcePayload, SessionPayload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("No session for peer '{0}'")]
    UnknownPeer(String),

    #[error("Invalid signaling payload: {0}")]
    InvalidPayload(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Status einer Peer-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Keine Session
    Idle,
    /// Offer gesendet, warte auf Answer
    OfferCreated,
    /// Offer empfangen, Answer wird erzeugt
    AnswerPending,
    /// Offer/Answer abgeschlossen
    Connected,
    /// Session geschlossen
    Closed,
}

/// Aktiver Sprachmodus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceMode {
    Idle,
    /// 1:1 Anruf(e) über `call_user` oder eingehende Offers
    Direct,
    /// Mitglied eines Voice Channels
    Channel {
        server_id: String,
        channel_id: String,
    },
}

/// Events die vom Coordinator ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged { peer_id: String, state: CallState },
    ModeChanged(VoiceMode),
}

/// Momentaufnahme einer Session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer_id: String,
    pub state: CallState,
    /// Zeitpunkt des letzten Zustandswechsels
    pub since: DateTime<Utc>,
}

struct PeerCallSession {
    id: Uuid,
    peer_id: String,
    connection: Arc<dyn PeerConnection>,
    state: CallState,
    since: DateTime<Utc>,
}

impl PeerCallSession {
    fn new(peer_id: &str, connection: Arc<dyn PeerConnection>, state: CallState) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id: peer_id.to_string(),
            connection,
            state,
            since: Utc::now(),
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer_id: self.peer_id.clone(),
            state: self.state,
            since: self.since,
        }
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Shared {
    sink: Arc<dyn EnvelopeSink>,
    factory: Arc<dyn PeerConnectionFactory>,
    audio: Arc<AudioPipeline>,
    /// Wird nie über ein `.await` hinweg gehalten
    sessions: Mutex<HashMap<String, PeerCallSession>>,
    mode: Mutex<VoiceMode>,
    event_tx: broadcast::Sender<CallEvent>,
    peer_events: PeerEvents,
    offer_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Shared {
    fn emit(&self, peer_id: &str, state: CallState) {
        tracing::debug!("Call state for {}: {:?}", peer_id, state);
        let _ = self.event_tx.send(CallEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    fn set_mode(&self, mode: VoiceMode) -> VoiceMode {
        let previous = std::mem::replace(&mut *self.mode.lock(), mode.clone());
        if previous != mode {
            tracing::info!("Voice mode: {:?}", mode);
            let _ = self.event_tx.send(CallEvent::ModeChanged(mode));
        }
        previous
    }

    /// Wechselt nach `Direct`, ein aktiver Voice Channel bleibt bestehen
    fn enter_direct_if_idle(&self) {
        let changed = {
            let mut mode = self.mode.lock();
            if *mode == VoiceMode::Idle {
                *mode = VoiceMode::Direct;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!("Voice mode: {:?}", VoiceMode::Direct);
            let _ = self.event_tx.send(CallEvent::ModeChanged(VoiceMode::Direct));
        }
    }

    /// Setzt den Zustand, falls die Session noch dieselbe ist
    fn update_state(&self, peer_id: &str, session_id: Uuid, state: CallState) -> bool {
        let updated = match self.sessions.lock().get_mut(peer_id) {
            Some(session) if session.id == session_id => {
                session.state = state;
                session.since = Utc::now();
                true
            }
            _ => false,
        };
        if updated {
            self.emit(peer_id, state);
        }
        updated
    }

    /// Entfernt die Session, falls sie noch dieselbe ist
    fn take_session(&self, peer_id: &str, session_id: Uuid) -> Option<PeerCallSession> {
        let mut sessions = self.sessions.lock();
        match sessions.get(peer_id) {
            Some(session) if session.id == session_id => sessions.remove(peer_id),
            _ => None,
        }
    }

    /// Fügt eine Session ein und schließt eine eventuell verdrängte
    async fn insert_session(&self, session: PeerCallSession) {
        let peer_id = session.peer_id.clone();
        let state = session.state;
        let replaced = self.sessions.lock().insert(peer_id.clone(), session);
        if let Some(old) = replaced {
            self.close_session(old).await;
        }
        self.emit(&peer_id, state);
    }

    async fn close_session(&self, session: PeerCallSession) {
        if let Err(e) = session.connection.close().await {
            tracing::warn!("Failed to close peer connection to {}: {}", session.peer_id, e);
        }
        self.emit(&session.peer_id, CallState::Closed);
    }

    async fn close_all(&self) -> usize {
        let sessions: Vec<PeerCallSession> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            self.close_session(session).await;
        }
        count
    }

    /// Startet Capture und Playback, Gerätefehler werden nur geloggt
    fn start_audio(&self) {
        let results = [self.audio.start_capture(), self.audio.start_playback()];
        for error in results.into_iter().filter_map(Result::err) {
            tracing::error!("{}", CallEngineError::from(error));
        }
    }

    /// Stoppt Audio wenn weder Sessions noch ein Voice Channel übrig sind
    fn release_audio_if_idle(&self) {
        if !self.sessions.lock().is_empty() {
            return;
        }
        if matches!(*self.mode.lock(), VoiceMode::Channel { .. }) {
            return;
        }
        self.audio.stop();
        self.set_mode(VoiceMode::Idle);
    }

    async fn expire_offer(&self, peer_id: &str, session_id: Uuid) {
        let expired = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer_id) {
                Some(s) if s.id == session_id && s.state == CallState::OfferCreated => {
                    sessions.remove(peer_id)
                }
                _ => None,
            }
        };

        if let Some(session) = expired {
            tracing::warn!("No answer from {}, closing pending offer", peer_id);
            self.close_session(session).await;
            self.release_audio_if_idle();
        }
    }
}

// ============================================================================
// SIGNALING COORDINATOR
// ============================================================================

/// Koordiniert Peer-Sessions und Audio
///
/// Muss innerhalb einer Tokio-Runtime erzeugt werden. Hintergrund-Tasks
/// (ICE-Weiterleitung, Audio-Routing) enden beim Drop.
pub struct SignalingCoordinator {
    shared: Arc<Shared>,
}

impl SignalingCoordinator {
    pub fn new(
        sink: Arc<dyn EnvelopeSink>,
        factory: Arc<dyn PeerConnectionFactory>,
        audio: Arc<AudioPipeline>,
        config: &ClientConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let frames = audio.subscribe_frames();

        let shared = Arc::new(Shared {
            sink,
            factory,
            audio,
            sessions: Mutex::new(HashMap::new()),
            mode: Mutex::new(VoiceMode::Idle),
            event_tx,
            peer_events: PeerEvents {
                ice_candidates: ice_tx,
                audio: audio_tx,
            },
            offer_timeout: config.offer_timeout,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(forward_ice_candidates(Arc::clone(&shared), ice_rx));
        tokio::spawn(play_inbound_audio(Arc::clone(&shared), audio_rx));
        tokio::spawn(forward_captured_audio(Arc::clone(&shared), frames));

        Self { shared }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn audio(&self) -> &Arc<AudioPipeline> {
        &self.shared.audio
    }

    /// Zustand der Session zu `peer_id`, `Idle` wenn keine existiert
    pub fn state(&self, peer_id: &str) -> CallState {
        self.shared
            .sessions
            .lock()
            .get(peer_id)
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.shared.sessions.lock().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        sessions
    }

    pub fn mode(&self) -> VoiceMode {
        self.shared.mode.lock().clone()
    }

    pub fn in_voice_channel(&self) -> bool {
        matches!(self.mode(), VoiceMode::Channel { .. })
    }

    // ========================================================================
    // DIRECT CALLS
    // ========================================================================

    /// Startet einen Anruf, Fehler werden geloggt
    pub async fn call_user(&self, peer_id: &str) {
        if let Err(e) = self.try_call_user(peer_id).await {
            tracing::error!("Failed to call {}: {}", peer_id, e);
        }
    }

    /// Erzeugt eine Session, setzt das lokale Offer und sendet `webrtc_offer`
    ///
    /// Eine bestehende Session zum selben Peer wird ersetzt, ein aktiver
    /// Voice Channel wird vorher verlassen.
    pub async fn try_call_user(&self, peer_id: &str) -> Result<(), CallEngineError> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(CallEngineError::UnknownPeer(String::new()));
        }

        if self.in_voice_channel() {
            tracing::info!("Leaving voice channel for direct call to {}", peer_id);
            self.leave_voice_channel().await;
        }

        let previous = self.shared.sessions.lock().remove(peer_id);
        if let Some(previous) = previous {
            tracing::info!("Replacing existing session with {}", peer_id);
            self.shared.close_session(previous).await;
        }

        let connection = match self
            .shared
            .factory
            .create(peer_id, self.shared.peer_events.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.shared.release_audio_if_idle();
                return Err(e);
            }
        };

        let offer = match negotiate_offer(connection.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::warn!(
                        "Failed to close peer connection to {}: {}",
                        peer_id,
                        close_err
                    );
                }
                self.shared.release_audio_if_idle();
                return Err(e);
            }
        };

        let session = PeerCallSession::new(peer_id, connection, CallState::OfferCreated);
        let session_id = session.id;
        self.shared.set_mode(VoiceMode::Direct);
        self.shared.insert_session(session).await;

        // Ein Sendefehler rollt den lokalen Zustand nicht zurück
        self.shared
            .sink
            .send_envelope(Envelope::webrtc_offer(peer_id, offer))
            .await;

        self.shared.start_audio();
        self.arm_offer_timeout(peer_id, session_id);

        tracing::info!("Calling {}", peer_id);
        Ok(())
    }

    /// Verarbeitet ein eingehendes Offer, Fehler werden geloggt
    pub async fn handle_offer(&self, from: &str, offer: SessionPayload) {
        if let Err(e) = self.try_handle_offer(from, offer).await {
            tracing::error!("Failed to handle offer from {}: {}", from, e);
        }
    }

    /// Setzt das Offer als Remote Description und antwortet mit `webrtc_answer`
    pub async fn try_handle_offer(
        &self,
        from: &str,
        offer: SessionPayload,
    ) -> Result<(), CallEngineError> {
        let existing = self
            .shared
            .sessions
            .lock()
            .get(from)
            .map(|s| (s.id, Arc::clone(&s.connection)));

        let (session_id, connection, created) = match existing {
            Some((id, connection)) => {
                tracing::debug!("Reusing session with {} for incoming offer", from);
                (id, connection, false)
            }
            None => {
                let connection = self
                    .shared
                    .factory
                    .create(from, self.shared.peer_events.clone())
                    .await?;
                let session =
                    PeerCallSession::new(from, Arc::clone(&connection), CallState::AnswerPending);
                let id = session.id;
                self.shared.insert_session(session).await;
                (id, connection, true)
            }
        };

        // Eingehende Offers treten dem aktuellen Modus bei
        self.shared.enter_direct_if_idle();

        let answer = match negotiate_answer(connection.as_ref(), offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if created {
                    if let Some(session) = self.shared.take_session(from, session_id) {
                        self.shared.close_session(session).await;
                    }
                    self.shared.release_audio_if_idle();
                }
                return Err(e);
            }
        };

        self.shared
            .sink
            .send_envelope(Envelope::webrtc_answer(from, answer))
            .await;

        // Gilt als verbunden sobald das Answer raus ist
        self.shared
            .update_state(from, session_id, CallState::Connected);
        self.shared.start_audio();

        tracing::info!("Answered call from {}", from);
        Ok(())
    }

    /// Verarbeitet ein Answer, unbekannte Peers werden ignoriert
    pub async fn handle_answer(&self, from: &str, answer: SessionPayload) {
        match self.try_handle_answer(from, answer).await {
            Ok(()) => {}
            Err(CallEngineError::UnknownPeer(_)) => {
                tracing::debug!("Dropping answer from {} without session", from);
            }
            Err(e) => tracing::error!("Failed to handle answer from {}: {}", from, e),
        }
    }

    /// Setzt das Answer als Remote Description einer Session in `OfferCreated`
    pub async fn try_handle_answer(
        &self,
        from: &str,
        answer: SessionPayload,
    ) -> Result<(), CallEngineError> {
        let (session_id, connection) = {
            let sessions = self.shared.sessions.lock();
            match sessions.get(from) {
                None => return Err(CallEngineError::UnknownPeer(from.to_string())),
                Some(s) if s.state != CallState::OfferCreated => {
                    tracing::warn!("Ignoring answer from {} in state {:?}", from, s.state);
                    return Ok(());
                }
                Some(s) => (s.id, Arc::clone(&s.connection)),
            }
        };

        connection.set_remote_description(answer).await?;
        self.shared
            .update_state(from, session_id, CallState::Connected);

        tracing::info!("Call with {} connected", from);
        Ok(())
    }

    /// Fügt einen Remote ICE Candidate hinzu, unbekannte Peers werden ignoriert
    pub async fn handle_ice_candidate(&self, from: &str, candidate: IcePayload) {
        match self.try_handle_ice_candidate(from, candidate).await {
            Ok(()) => {}
            Err(CallEngineError::UnknownPeer(_)) => {
                tracing::debug!("Dropping ICE candidate from {} without session", from);
            }
            Err(e) => tracing::warn!("Failed to add ICE candidate from {}: {}", from, e),
        }
    }

    pub async fn try_handle_ice_candidate(
        &self,
        from: &str,
        candidate: IcePayload,
    ) -> Result<(), CallEngineError> {
        let connection = self
            .shared
            .sessions
            .lock()
            .get(from)
            .map(|s| Arc::clone(&s.connection))
            .ok_or_else(|| CallEngineError::UnknownPeer(from.to_string()))?;

        connection.add_ice_candidate(candidate).await
    }

    /// Beendet alle Sessions und stoppt Audio, ohne `leave_voice` zu senden
    pub async fn hang_up(&self) {
        let closed = self.shared.close_all().await;
        self.shared.audio.stop();
        self.shared.set_mode(VoiceMode::Idle);
        tracing::info!("Hung up {} session(s)", closed);
    }

    /// Beendet die Session zu einem Peer
    pub async fn hang_up_peer(&self, peer_id: &str) {
        let session = self.shared.sessions.lock().remove(peer_id);
        match session {
            Some(session) => {
                self.shared.close_session(session).await;
                self.shared.release_audio_if_idle();
                tracing::info!("Hung up {}", peer_id);
            }
            None => tracing::debug!("No session with {} to hang up", peer_id),
        }
    }

    // ========================================================================
    // VOICE CHANNELS
    // ========================================================================

    /// Tritt einem Voice Channel bei (`join_voice`) und startet Audio
    pub async fn join_voice_channel(&self, server_id: &str, channel_id: &str) {
        match self.mode() {
            VoiceMode::Direct => {
                tracing::info!("Joining voice channel ends direct call");
                self.hang_up().await;
            }
            VoiceMode::Channel {
                server_id: current_server,
                channel_id: current_channel,
            } => {
                if current_server == server_id && current_channel == channel_id {
                    tracing::debug!("Already in voice channel {}", channel_id);
                    self.shared.start_audio();
                    return;
                }
                self.leave_voice_channel().await;
            }
            VoiceMode::Idle => {}
        }

        self.shared.set_mode(VoiceMode::Channel {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
        });

        self.shared
            .sink
            .send_envelope(Envelope::join_voice(server_id, channel_id))
            .await;

        self.shared.start_audio();
        tracing::info!("Joined voice channel {}/{}", server_id, channel_id);
    }

    /// Verlässt den Voice Channel: `leave_voice`, Audio stoppen, alle Sessions schließen
    ///
    /// Idempotent, auch ohne offene Sessions.
    pub async fn leave_voice_channel(&self) {
        let previous = self.shared.set_mode(VoiceMode::Idle);
        let (server_id, channel_id) = match previous {
            VoiceMode::Channel {
                server_id,
                channel_id,
            } => (Some(server_id), Some(channel_id)),
            _ => (None, None),
        };

        self.shared
            .sink
            .send_envelope(Envelope::leave_voice(server_id, channel_id))
            .await;

        self.shared.audio.stop();
        let closed = self.shared.close_all().await;
        tracing::info!("Left voice channel, closed {} session(s)", closed);
    }

    // ========================================================================
    // AUDIO CONTROLS
    // ========================================================================

    pub fn set_muted(&self, muted: bool) {
        self.shared.audio.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.audio.is_muted()
    }

    pub fn set_deafened(&self, deafened: bool) {
        self.shared.audio.set_deafened(deafened);
    }

    pub fn is_deafened(&self) -> bool {
        self.shared.audio.is_deafened()
    }

    /// Gibt Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.shared.audio.levels()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn arm_offer_timeout(&self, peer_id: &str, session_id: Uuid) {
        let timeout = match self.shared.offer_timeout {
            Some(timeout) => timeout,
            None => return,
        };

        let shared = Arc::clone(&self.shared);
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    shared.expire_offer(&peer_id, session_id).await;
                }
            }
        });
    }
}

impl Drop for SignalingCoordinator {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for SignalingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingCoordinator")
            .field("mode", &self.mode())
            .field("sessions", &self.session_count())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

async fn negotiate_offer(connection: &dyn PeerConnection) -> Result<SessionPayload, CallEngineError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn negotiate_answer(
    connection: &dyn PeerConnection,
    offer: SessionPayload,
) -> Result<SessionPayload, CallEngineError> {
    connection.set_remote_description(offer).await?;
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    Ok(answer)
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Sendet lokal gefundene ICE Candidates als `webrtc_ice`, einer pro Nachricht
async fn forward_ice_candidates(
    shared: Arc<Shared>,
    mut candidates: mpsc::UnboundedReceiver<(String, IcePayload)>,
) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = candidates.recv() => next,
        };
        match next {
            Some((peer_id, candidate)) => {
                tracing::trace!("Forwarding ICE candidate to {}", peer_id);
                shared
                    .sink
                    .send_envelope(Envelope::webrtc_ice(peer_id, candidate))
                    .await;
            }
            None => break,
        }
    }
}

/// Gibt empfangenes Audio in Ankunftsreihenfolge wieder
async fn play_inbound_audio(
    shared: Arc<Shared>,
    mut frames: mpsc::UnboundedReceiver<(String, AudioFrame)>,
) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = frames.recv() => next,
        };
        match next {
            Some((_, frame)) => shared.audio.play_audio(&frame),
            None => break,
        }
    }
}

/// Schickt aufgenommene Frames an alle verbundenen Sessions
async fn forward_captured_audio(
    shared: Arc<Shared>,
    mut frames: broadcast::Receiver<AudioFrame>,
) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = frames.recv() => next,
        };
        match next {
            Ok(frame) => {
                let targets: Vec<(String, Arc<dyn PeerConnection>)> = shared
                    .sessions
                    .lock()
                    .values()
                    .filter(|s| s.state == CallState::Connected)
                    .map(|s| (s.peer_id.clone(), Arc::clone(&s.connection)))
                    .collect();

                for (peer_id, connection) in targets {
                    if let Err(e) = connection.send_audio(&frame).await {
                        tracing::trace!("Failed to send audio to {}: {}", peer_id, e);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Audio forwarding lagged, skipped {} frames", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
