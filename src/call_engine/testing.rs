//! Test-Doubles für Audio-Geräte, Peer Connections und den Signaling-Kanal

use super::audio::{AudioBackend, AudioError, AudioFrame, AudioStream, CaptureCallback, PlaybackBuffer};
use super::engine::CallEngineError;
use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvents};
use crate::signaling::{Envelope, EnvelopeSink, IcePayload, SessionPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// AUDIO
// ============================================================================

type CallbackSlot = Arc<Mutex<Option<CaptureCallback>>>;
type OutputSlot = Arc<Mutex<Option<Arc<PlaybackBuffer>>>>;

/// Backend ohne Hardware: Eingabe wird per `feed_input` eingespeist
#[derive(Default)]
pub(crate) struct FakeAudioBackend {
    input: CallbackSlot,
    output: OutputSlot,
    inputs_opened: AtomicUsize,
    active: Arc<AtomicUsize>,
    fail: AtomicBool,
}

struct FakeStream {
    active: Arc<AtomicUsize>,
    input: Option<CallbackSlot>,
    output: Option<OutputSlot>,
}

impl AudioStream for FakeStream {}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(slot) = &self.input {
            slot.lock().take();
        }
        if let Some(slot) = &self.output {
            slot.lock().take();
        }
    }
}

impl FakeAudioBackend {
    /// Simuliert einen Treiber-Callback des Mikrofons
    pub fn feed_input(&self, samples: &[i16]) {
        if let Some(callback) = self.input.lock().as_mut() {
            callback(samples);
        }
    }

    /// Simuliert einen Treiber-Callback des Lautsprechers
    pub fn drain_output(&self, out: &mut [i16]) -> usize {
        match self.output.lock().as_ref() {
            Some(buffer) => buffer.read(out),
            None => 0,
        }
    }

    pub fn fail_devices(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn inputs_opened(&self) -> usize {
        self.inputs_opened.load(Ordering::SeqCst)
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn open_input(&self, on_samples: CaptureCallback) -> Result<Box<dyn AudioStream>, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::NoInputDevice);
        }
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        *self.input.lock() = Some(on_samples);

        Ok(Box::new(FakeStream {
            active: Arc::clone(&self.active),
            input: Some(Arc::clone(&self.input)),
            output: None,
        }))
    }

    fn open_output(
        &self,
        buffer: Arc<PlaybackBuffer>,
    ) -> Result<Box<dyn AudioStream>, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::NoOutputDevice);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        *self.output.lock() = Some(buffer);

        Ok(Box::new(FakeStream {
            active: Arc::clone(&self.active),
            input: None,
            output: Some(Arc::clone(&self.output)),
        }))
    }
}

// ============================================================================
// PEERS
// ============================================================================

/// Protokoll aller Aufrufe auf einer Fake-Verbindung
#[derive(Default)]
pub(crate) struct FakePeerLog {
    pub local: Mutex<Vec<SessionPayload>>,
    pub remote: Mutex<Vec<SessionPayload>>,
    pub candidates: Mutex<Vec<IcePayload>>,
    pub sent_audio: Mutex<Vec<AudioFrame>>,
    pub closed: AtomicBool,
}

pub(crate) struct FakePeer {
    peer_id: String,
    log: Arc<FakePeerLog>,
    events: PeerEvents,
}

impl FakePeer {
    /// Meldet einen lokal gefundenen ICE Candidate
    pub fn emit_candidate(&self, candidate: IcePayload) {
        let _ = self
            .events
            .ice_candidates
            .send((self.peer_id.clone(), candidate));
    }

    /// Meldet empfangenes Audio vom Peer
    pub fn emit_audio(&self, frame: AudioFrame) {
        let _ = self.events.audio.send((self.peer_id.clone(), frame));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionPayload, CallEngineError> {
        Ok(json!({"type": "offer", "sdp": format!("offer-for-{}", self.peer_id)}))
    }

    async fn create_answer(&self) -> Result<SessionPayload, CallEngineError> {
        if self.log.remote.lock().is_empty() {
            return Err(CallEngineError::WebRTC("no remote description".to_string()));
        }
        Ok(json!({"type": "answer", "sdp": format!("answer-for-{}", self.peer_id)}))
    }

    async fn set_local_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError> {
        self.log.local.lock().push(sdp);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionPayload) -> Result<(), CallEngineError> {
        if sdp.get("sdp").is_none() {
            return Err(CallEngineError::InvalidPayload("missing sdp".to_string()));
        }
        self.log.remote.lock().push(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IcePayload) -> Result<(), CallEngineError> {
        self.log.candidates.lock().push(candidate);
        Ok(())
    }

    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), CallEngineError> {
        self.log.sent_audio.lock().push(frame.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), CallEngineError> {
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory die alle erzeugten Verbindungen zur Inspektion aufbewahrt
#[derive(Default)]
pub(crate) struct FakePeerFactory {
    created: Mutex<Vec<(String, Arc<FakePeer>)>>,
    fail: AtomicBool,
}

impl FakePeerFactory {
    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Zuletzt erzeugte Verbindung für einen Peer
    pub fn peer(&self, peer_id: &str) -> Option<Arc<FakePeer>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == peer_id)
            .map(|(_, peer)| Arc::clone(peer))
    }

    pub fn log(&self, peer_id: &str) -> Option<Arc<FakePeerLog>> {
        self.peer(peer_id).map(|p| Arc::clone(&p.log))
    }

    /// Alle Logs in Erzeugungsreihenfolge
    pub fn logs(&self) -> Vec<Arc<FakePeerLog>> {
        self.created
            .lock()
            .iter()
            .map(|(_, p)| Arc::clone(&p.log))
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerConnection>, CallEngineError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(CallEngineError::WebRTC("factory failure".to_string()));
        }

        let peer = Arc::new(FakePeer {
            peer_id: peer_id.to_string(),
            log: Arc::new(FakePeerLog::default()),
            events,
        });
        self.created
            .lock()
            .push((peer_id.to_string(), Arc::clone(&peer)));
        Ok(peer)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Sammelt alle gesendeten Envelopes
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Gesendete Envelopes eines Typs
    pub fn of_type(&self, msg_type: &str) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.msg_type == msg_type)
            .cloned()
            .collect()
    }

    pub fn count_by_type(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for envelope in self.sent.lock().iter() {
            *counts.entry(envelope.msg_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn send_envelope(&self, envelope: Envelope) {
        self.sent.lock().push(envelope);
    }
}
