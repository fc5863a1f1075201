//! Audio Pipeline - Mikrofon Capture und Playback
//!
//! Festes Format: 48 kHz, 16 Bit signed, Mono. Aufgenommene Chunks werden
//! als [`AudioFrame`] verteilt, eingehendes Audio landet im
//! [`PlaybackBuffer`]. Die Geräte-Anbindung steckt hinter [`AudioBackend`],
//! produktiv via cpal.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Voice)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Bytes pro Sample (16 Bit signed, little endian)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Kapazität des Playback-Buffers
pub const PLAYBACK_BUFFER_DURATION: Duration = Duration::from_secs(2);

/// Wie viele Frames ein langsamer Subscriber zurückliegen darf
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to query audio devices: {0}")]
    DeviceQuery(String),
}

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein unveränderlicher Chunk PCM (i16 LE, 48kHz, Mono)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self(Bytes::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Billiger Clone des zugrunde liegenden Buffers
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Abspieldauer bei 48kHz Mono
    pub fn duration(&self) -> Duration {
        let samples = (self.0.len() / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / SAMPLE_RATE as u64)
    }
}

// ============================================================================
// PLAYBACK BUFFER
// ============================================================================

/// Begrenzte FIFO für abzuspielendes PCM
///
/// Bei Überlauf werden die ältesten Samples verworfen, damit die Latenz
/// nicht über die Kapazität hinaus wächst.
pub struct PlaybackBuffer {
    samples: Mutex<HeapRb<i16>>,
    capacity: usize,
    output_level: Mutex<f32>,
}

impl PlaybackBuffer {
    /// Kapazität in Samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(HeapRb::new(capacity)),
            capacity,
            output_level: Mutex::new(0.0),
        }
    }

    /// Kapazität als Zeitspanne bei 48kHz Mono
    pub fn with_duration(duration: Duration) -> Self {
        let samples = (duration.as_millis() as usize * SAMPLE_RATE as usize) / 1000;
        Self::new(samples)
    }

    /// Hängt PCM-Bytes an, gibt die Anzahl verworfener Samples zurück
    pub fn write(&self, pcm: &[u8]) -> usize {
        if pcm.len() % BYTES_PER_SAMPLE != 0 {
            tracing::trace!("Odd PCM length {}, dropping trailing byte", pcm.len());
        }

        let incoming: Vec<i16> = pcm
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        let mut dropped = 0;
        let incoming = if incoming.len() > self.capacity {
            dropped += incoming.len() - self.capacity;
            &incoming[incoming.len() - self.capacity..]
        } else {
            &incoming[..]
        };

        let mut buffer = self.samples.lock();
        let overflow = incoming.len().saturating_sub(buffer.vacant_len());
        if overflow > 0 {
            dropped += buffer.skip(overflow);
        }
        buffer.push_slice(incoming);

        if dropped > 0 {
            tracing::trace!("Playback buffer overflow, dropped {} samples", dropped);
        }
        dropped
    }

    /// Liest bis zu `out.len()` Samples, der Rest wird mit Stille gefüllt
    pub fn read(&self, out: &mut [i16]) -> usize {
        let read = self.samples.lock().pop_slice(out);
        out[read..].fill(0);

        if !out.is_empty() {
            let sum: f32 = out
                .iter()
                .map(|s| (s.to_sample::<f32>()).abs())
                .sum();
            *self.output_level.lock() = (sum / out.len() as f32).min(1.0);
        }
        read
    }

    /// Gepufferte Samples
    pub fn len(&self) -> usize {
        self.samples.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut buffer = self.samples.lock();
        let occupied = buffer.occupied_len();
        buffer.skip(occupied);
    }

    /// Mittlerer Pegel des zuletzt gelesenen Blocks (0.0 - 1.0)
    pub fn output_level(&self) -> f32 {
        *self.output_level.lock()
    }
}

// ============================================================================
// BACKEND ABSTRACTION
// ============================================================================

/// Laufender Geräte-Stream, Droppen gibt das Gerät frei
pub trait AudioStream: Send {}

/// Callback des Capture-Treibers, bekommt PCM im Zielformat
pub type CaptureCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Öffnet Ein- und Ausgabegeräte
pub trait AudioBackend: Send + Sync {
    /// Öffnet das Mikrofon, `on_samples` läuft im Treiber-Thread
    fn open_input(&self, on_samples: CaptureCallback) -> Result<Box<dyn AudioStream>, AudioError>;

    /// Öffnet den Lautsprecher, der Treiber liest aus `buffer`
    fn open_output(&self, buffer: Arc<PlaybackBuffer>)
        -> Result<Box<dyn AudioStream>, AudioError>;
}

// ============================================================================
// AUDIO PIPELINE
// ============================================================================

struct PlaybackHandle {
    _stream: Box<dyn AudioStream>,
    buffer: Arc<PlaybackBuffer>,
}

/// Capture und Playback mit getrenntem Mute (Mikrofon) und Deafen (Lautsprecher)
pub struct AudioPipeline {
    backend: Arc<dyn AudioBackend>,
    capture: Mutex<Option<Box<dyn AudioStream>>>,
    playback: Mutex<Option<PlaybackHandle>>,

    /// Mikrofon stumm: Frames werden verworfen
    is_muted: Arc<AtomicBool>,
    /// Lautsprecher stumm: eingehendes Audio wird verworfen
    is_deafened: Arc<AtomicBool>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,

    frame_tx: broadcast::Sender<AudioFrame>,
}

impl AudioPipeline {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        tracing::info!(
            "AudioPipeline initialized: {}Hz, {} channel(s), 16 bit",
            SAMPLE_RATE,
            CHANNELS
        );

        Self {
            backend,
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            is_muted: Arc::new(AtomicBool::new(false)),
            is_deafened: Arc::new(AtomicBool::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
            frame_tx,
        }
    }

    /// Pipeline mit cpal-Standardgeräten
    pub fn with_default_devices() -> Self {
        Self::new(Arc::new(CpalBackend::new()))
    }

    /// Empfänger für aufgenommene Frames
    pub fn subscribe_frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.frame_tx.subscribe()
    }

    /// Startet Audio Capture (Mikrofon)
    ///
    /// Läuft die Aufnahme bereits, bleibt der bestehende Stream aktiv.
    pub fn start_capture(&self) -> Result<(), AudioError> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            tracing::debug!("Audio capture already running");
            return Ok(());
        }

        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let frame_tx = self.frame_tx.clone();

        let stream = self.backend.open_input(Box::new(move |samples: &[i16]| {
            if samples.is_empty() {
                return;
            }

            // Audio Level berechnen (RMS)
            let sum: f32 = samples
                .iter()
                .map(|s| {
                    let v = s.to_sample::<f32>();
                    v * v
                })
                .sum();
            *input_level.lock() = (sum / samples.len() as f32).sqrt().min(1.0);

            if is_muted.load(Ordering::Relaxed) {
                return;
            }

            // Ohne Subscriber wird der Frame einfach verworfen
            let _ = frame_tx.send(AudioFrame::from_samples(samples));
        }))?;

        *capture = Some(stream);
        tracing::info!("Audio capture started");
        Ok(())
    }

    /// Stoppt die Aufnahme, No-op wenn nicht gestartet
    pub fn stop_capture(&self) {
        if self.capture.lock().take().is_some() {
            *self.input_level.lock() = 0.0;
            tracing::info!("Audio capture stopped");
        }
    }

    /// Startet Audio Playback (Lautsprecher) mit 2s Buffer
    pub fn start_playback(&self) -> Result<(), AudioError> {
        let mut playback = self.playback.lock();
        if playback.is_some() {
            tracing::debug!("Audio playback already running");
            return Ok(());
        }

        let buffer = Arc::new(PlaybackBuffer::with_duration(PLAYBACK_BUFFER_DURATION));
        let stream = self.backend.open_output(Arc::clone(&buffer))?;

        *playback = Some(PlaybackHandle {
            _stream: stream,
            buffer,
        });
        tracing::info!("Audio playback started");
        Ok(())
    }

    /// Stoppt die Wiedergabe, No-op wenn nicht gestartet
    pub fn stop_playback(&self) {
        if self.playback.lock().take().is_some() {
            tracing::info!("Audio playback stopped");
        }
    }

    /// Stoppt Capture und Playback
    pub fn stop(&self) {
        self.stop_capture();
        self.stop_playback();
    }

    /// Schreibt einen Frame in den Playback-Buffer
    ///
    /// Verworfen wenn Deafen aktiv ist oder keine Wiedergabe läuft.
    pub fn play_audio(&self, frame: &AudioFrame) {
        if self.is_deafened.load(Ordering::Relaxed) {
            return;
        }

        let buffer = match self.playback.lock().as_ref() {
            Some(handle) => Arc::clone(&handle.buffer),
            None => {
                tracing::trace!("Playback not running, dropping {} bytes", frame.len());
                return;
            }
        };
        buffer.write(frame.as_bytes());
    }

    /// Setzt den Mute-Status (nur Mikrofon)
    pub fn set_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    /// Setzt den Deafen-Status (nur Wiedergabe)
    pub fn set_deafened(&self, deafened: bool) {
        self.is_deafened.store(deafened, Ordering::Relaxed);
        tracing::debug!("Audio deafened: {}", deafened);
    }

    pub fn is_deafened(&self) -> bool {
        self.is_deafened.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().is_some()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        let output = self
            .playback
            .lock()
            .as_ref()
            .map(|h| h.buffer.output_level())
            .unwrap_or(0.0);
        (*self.input_level.lock(), output)
    }

    /// Aktuell gepufferte Playback-Samples
    pub fn buffered_samples(&self) -> usize {
        self.playback
            .lock()
            .as_ref()
            .map(|h| h.buffer.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("capturing", &self.is_capturing())
            .field("playing", &self.is_playing())
            .field("muted", &self.is_muted())
            .field("deafened", &self.is_deafened())
            .finish()
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

/// Standardgeräte des System-Hosts via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

/// cpal::Stream ist nicht auf allen Plattformen Send. Der Stream wird nur
/// gehalten und gedroppt, nie aus einem anderen Thread bedient.
struct CpalStream(#[allow(dead_code)] Stream);

unsafe impl Send for CpalStream {}

impl AudioStream for CpalStream {}

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Gibt alle verfügbaren Audio-Geräte zurück (inputs, outputs)
    pub fn list_devices() -> Result<(Vec<AudioDevice>, Vec<AudioDevice>), AudioError> {
        let host = cpal::default_host();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let inputs = host
            .input_devices()
            .map_err(|e| AudioError::DeviceQuery(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_input.as_ref(),
                    name,
                })
            })
            .collect();

        let outputs = host
            .output_devices()
            .map_err(|e| AudioError::DeviceQuery(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_output.as_ref(),
                    name,
                })
            })
            .collect();

        Ok((inputs, outputs))
    }

    fn build_input<T>(
        device: &Device,
        config: &StreamConfig,
        mut on_samples: CaptureCallback,
    ) -> Result<Stream, AudioError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        let source_rate = config.sample_rate.0;

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // Erster Kanal als Mono-Quelle
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame[0].to_sample::<f32>())
                        .collect();

                    let resampled = resample_linear(&mono, source_rate, SAMPLE_RATE);
                    let pcm: Vec<i16> = resampled.iter().map(|s| s.to_sample::<i16>()).collect();
                    on_samples(&pcm);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))
    }

    fn build_output<T>(
        device: &Device,
        config: &StreamConfig,
        buffer: Arc<PlaybackBuffer>,
    ) -> Result<Stream, AudioError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let target_rate = config.sample_rate.0;
        let ratio = SAMPLE_RATE as f32 / target_rate as f32;

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let needed = (frames as f32 * ratio).ceil() as usize;

                    let mut pcm = vec![0i16; needed];
                    buffer.read(&mut pcm);

                    let source: Vec<f32> = pcm.iter().map(|s| s.to_sample::<f32>()).collect();
                    let samples = resample_linear(&source, SAMPLE_RATE, target_rate);

                    // Mono auf alle Kanäle verteilen
                    for (i, frame) in data.chunks_mut(channels).enumerate() {
                        let value = samples.get(i).copied().unwrap_or(0.0);
                        for out in frame.iter_mut() {
                            *out = value.to_sample::<T>();
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(
        device: &Device,
    ) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, on_samples: CaptureCallback) -> Result<Box<dyn AudioStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        let (config, format) = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Opening capture device: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0,
            config.channels,
            format
        );

        let stream = match format {
            SampleFormat::I16 => Self::build_input::<i16>(&device, &config, on_samples)?,
            SampleFormat::F32 => Self::build_input::<f32>(&device, &config, on_samples)?,
            other => {
                return Err(AudioError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Box::new(CpalStream(stream)))
    }

    fn open_output(
        &self,
        buffer: Arc<PlaybackBuffer>,
    ) -> Result<Box<dyn AudioStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let (config, format) = Self::find_best_output_config(&device)?;

        tracing::info!(
            "Opening playback device: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0,
            config.channels,
            format
        );

        let stream = match format {
            SampleFormat::I16 => Self::build_output::<i16>(&device, &config, buffer)?,
            SampleFormat::F32 => Self::build_output::<f32>(&device, &config, buffer)?,
            other => {
                return Err(AudioError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Box::new(CpalStream(stream)))
    }
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 48kHz vor anderen Raten, I16 vor F32, wenige Kanäle vor vielen.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let usable = |c: &&SupportedStreamConfigRange| {
        matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
    };
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;
    let format_rank = |c: &SupportedStreamConfigRange| match c.sample_format() {
        SampleFormat::I16 => 0,
        _ => 1,
    };

    let best = configs.iter().filter(usable).min_by_key(|c| {
        (
            !supports_target(c),
            format_rank(c),
            c.channels(),
        )
    });

    match best {
        Some(range) => {
            let rate = if supports_target(range) {
                target_rate
            } else {
                range.max_sample_rate()
            };
            let supported = range.clone().with_sample_rate(rate);
            Ok((supported.config(), supported.sample_format()))
        }
        None => Err(AudioError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        )),
    }
}

/// Einfaches lineares Resampling
fn resample_linear(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (input.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = input.get(idx).copied().unwrap_or(0.0);
            let s2 = input.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
