//! Call Engine Module - WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - Peer-Sessions für Direktanrufe und Voice Channels
//! - WebRTC Peer Connections mit Audio Data Channel
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)

mod audio;
mod engine;
mod peer;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{
    AudioBackend, AudioDevice, AudioError, AudioFrame, AudioPipeline, AudioStream,
    CaptureCallback, CpalBackend, PlaybackBuffer, CHANNELS, PLAYBACK_BUFFER_DURATION,
    SAMPLE_RATE,
};
pub use engine::{CallEngineError, CallEvent, CallState, SessionInfo, SignalingCoordinator, VoiceMode};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvents, WebRtcPeerFactory};
