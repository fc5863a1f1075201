//! Peer Connections
//!
//! [`PeerConnection`] kapselt eine einzelne WebRTC-Verbindung zu einem Peer.
//! Der Koordinator arbeitet nur gegen diese Traits, die produktive
//! Implementierung basiert auf webrtc-rs.
//!
//! Audio läuft als rohes PCM über einen vorab ausgehandelten Data Channel
//! (unordered, keine Retransmits).

use super::audio::AudioFrame;
use super::engine::CallEngineError;
use crate::signaling::{IcePayload, SessionPayload};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label des Audio Data Channels
pub const AUDIO_CHANNEL_LABEL: &str = "audio";

/// Stream-ID des vorab ausgehandelten Audio Channels (auf beiden Seiten gleich)
pub const AUDIO_CHANNEL_ID: u16 = 0;

// ============================================================================
// TRAITS
// ============================================================================

/// Rückkanäle einer Peer Connection zum Koordinator
///
/// Die Callbacks von webrtc-rs laufen auf fremden Tasks, deshalb wird alles
/// über Channels zurückgemeldet. Jede Nachricht trägt die Peer-ID.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    /// Lokal gefundene ICE Candidates
    pub ice_candidates: mpsc::UnboundedSender<(String, IcePayload)>,
    /// Empfangenes Audio
    pub audio: mpsc::UnboundedSender<(String, AudioFrame)>,
}

/// Eine Verbindung zu genau einem Peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Erzeugt ein SDP Offer
    async fn create_offer(&self) -> Result<SessionPayload, CallEngineError>;

    /// Erzeugt ein SDP Answer auf das gesetzte Remote Offer
    async fn create_answer(&self) -> Result<SessionPayload, CallEngineError>;

    async fn set_local_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError>;

    async fn set_remote_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError>;

    async fn add_ice_candidate(&self, candidate: IcePayload) -> Result<(), CallEngineError>;

    /// Sendet einen Audio Frame, verworfen solange der Channel nicht offen ist
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), CallEngineError>;

    async fn close(&self) -> Result<(), CallEngineError>;
}

/// Erzeugt neue Peer Connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Factory für webrtc-rs Peer Connections
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_urls: &[String]) -> Self {
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };

        Self { ice_servers }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        // Media Engine mit Standard-Codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| CallEngineError::WebRTC(e.to_string()))?,
        );

        // Beide Seiten legen den Channel mit derselben ID an, kein DCEP nötig
        let audio_channel = pc
            .create_data_channel(
                AUDIO_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    negotiated: Some(AUDIO_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        let peer = WebRtcPeer {
            peer_id: peer_id.to_string(),
            pc,
            audio_channel,
        };
        peer.register_handlers(events);

        tracing::debug!("Created peer connection for {}", peer_id);
        Ok(Arc::new(peer))
    }
}

struct WebRtcPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    audio_channel: Arc<RTCDataChannel>,
}

impl WebRtcPeer {
    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(&self, events: PeerEvents) {
        // Connection State Handler
        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                match s {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        tracing::warn!("Peer connection to {} is {:?}", peer_id, s);
                    }
                    _ => tracing::info!("Peer connection to {}: {:?}", peer_id, s),
                }
                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let peer_id = self.peer_id.clone();
        let ice_tx = events.ice_candidates;
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json().map(|init| serde_json::to_value(&init)) {
                        Ok(Ok(json)) => {
                            let _ = ice_tx.send((peer_id.clone(), json));
                        }
                        Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                        Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        // Eingehendes Audio
        let peer_id = self.peer_id.clone();
        let audio_tx = events.audio;
        self.audio_channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                if !msg.is_string {
                    let _ = audio_tx.send((peer_id.clone(), AudioFrame::from_bytes(msg.data)));
                }
                Box::pin(async {})
            }));

        let peer_id = self.peer_id.clone();
        self.audio_channel.on_open(Box::new(move || {
            tracing::info!("Audio channel to {} open", peer_id);
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionPayload, CallEngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;
        payload_from_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionPayload, CallEngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;
        payload_from_description(&answer)
    }

    async fn set_local_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError> {
        let description = description_from_payload(sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))
    }

    async fn set_remote_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError> {
        let description = description_from_payload(sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IcePayload) -> Result<(), CallEngineError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| CallEngineError::InvalidPayload(e.to_string()))?;

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))
    }

    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), CallEngineError> {
        if self.audio_channel.ready_state() != RTCDataChannelState::Open {
            tracing::trace!("Audio channel to {} not open, dropping frame", self.peer_id);
            return Ok(());
        }

        self.audio_channel
            .send(&frame.to_bytes())
            .await
            .map(|_| ())
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        self.pc
            .close()
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))
    }
}

// ============================================================================
// SDP PAYLOADS
// ============================================================================

/// Wire-Form einer Session Description: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    sdp_type: String,
    sdp: String,
}

fn payload_from_description(
    description: &RTCSessionDescription,
) -> Result<SessionPayload, CallEngineError> {
    serde_json::to_value(description).map_err(|e| CallEngineError::InvalidPayload(e.to_string()))
}

fn description_from_payload(
    payload: SessionPayload,
) -> Result<RTCSessionDescription, CallEngineError> {
    let payload: SdpPayload = serde_json::from_value(payload)
        .map_err(|e| CallEngineError::InvalidPayload(e.to_string()))?;

    let description = match payload.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(payload.sdp),
        "answer" => RTCSessionDescription::answer(payload.sdp),
        "pranswer" => RTCSessionDescription::pranswer(payload.sdp),
        other => {
            return Err(CallEngineError::InvalidPayload(format!(
                "unsupported session description type '{}'",
                other
            )))
        }
    };

    description.map_err(|e| CallEngineError::InvalidPayload(e.to_string()))
}
