//! Microphone capture pipeline: Idle -> Recording -> {Stopped | Cancelled}.
//!
//! The microphone is an exclusive resource; at most one recording session
//! exists at a time. Device access sits behind [`RecorderBackend`] so the
//! pipeline's lifecycle rules are testable without audio hardware.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vicinity_shared::constants::RECORDING_TICK_SECS;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("A recording is already in progress")]
    RecordingUnavailable,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No input device available")]
    NoInputDevice,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Failed to finalize recording: {0}")]
    Finalize(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A finalized capture: a locally-addressable artifact plus its metadata.
#[derive(Debug)]
pub struct VoiceArtifact {
    pub path: PathBuf,
    pub mime: String,
    pub duration_secs: u32,
}

/// Base64 form of a finalized capture, ready for inline transport.
#[derive(Debug, Clone)]
pub struct VoicePayload {
    pub audio_base64: String,
    pub mime: String,
    pub duration_secs: u32,
}

impl VoiceArtifact {
    /// Reads the artifact into a base64 payload and deletes the file; the
    /// artifact is never held past frame construction.
    pub fn into_payload(self) -> Result<VoicePayload, RecordingError> {
        let bytes = std::fs::read(&self.path)?;
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove voice artifact");
        }
        Ok(VoicePayload {
            audio_base64: BASE64.encode(bytes),
            mime: self.mime,
            duration_secs: self.duration_secs,
        })
    }
}

/// Device seam for the capture pipeline.
pub trait RecorderBackend: Send {
    /// Acquires the recording resource and starts capturing.
    fn begin(&mut self) -> Result<(), RecordingError>;

    /// Stops capturing, writes the artifact, and releases the resource.
    fn finalize(&mut self) -> Result<PathBuf, RecordingError>;

    /// Releases the resource without producing an artifact.
    fn discard(&mut self);

    /// MIME type of artifacts this backend produces.
    fn mime(&self) -> &str;
}

struct RecordingSession {
    started_at: Instant,
    elapsed: Arc<AtomicU32>,
    /// 1 Hz ticker updating the observable elapsed counter. Owned here so
    /// it has exactly one cancellation path.
    ticker: tokio::task::JoinHandle<()>,
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// The capture pipeline. Generic over the backend so tests use a mock.
pub struct VoiceRecorder<B: RecorderBackend> {
    backend: B,
    active: Option<RecordingSession>,
}

impl<B: RecorderBackend> VoiceRecorder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Seconds elapsed in the current recording, if one is active.
    pub fn elapsed_secs(&self) -> Option<u32> {
        self.active
            .as_ref()
            .map(|s| s.elapsed.load(Ordering::Relaxed))
    }

    /// Starts a recording. Fails without touching the device when a
    /// recording is already active.
    pub fn start(&mut self) -> Result<(), RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::RecordingUnavailable);
        }
        self.backend.begin()?;

        let elapsed = Arc::new(AtomicU32::new(0));
        let counter = elapsed.clone();
        let ticker = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(RECORDING_TICK_SECS));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        self.active = Some(RecordingSession {
            started_at: Instant::now(),
            elapsed,
            ticker,
        });
        debug!("Recording started");
        Ok(())
    }

    /// Finalizes the capture and returns the artifact. The device is
    /// released even when finalizing fails, so the pipeline never sticks
    /// in Recording.
    pub fn stop(&mut self) -> Result<VoiceArtifact, RecordingError> {
        let session = self.active.take().ok_or(RecordingError::NotRecording)?;
        let duration_secs = session.started_at.elapsed().as_secs() as u32;

        match self.backend.finalize() {
            Ok(path) => {
                debug!(path = %path.display(), duration_secs, "Recording finalized");
                Ok(VoiceArtifact {
                    path,
                    mime: self.backend.mime().to_string(),
                    duration_secs,
                })
            }
            Err(e) => {
                self.backend.discard();
                Err(e)
            }
        }
    }

    /// Aborts the capture, releasing the device and discarding any data.
    /// Safe to call when nothing is recording.
    pub fn cancel(&mut self) {
        if self.active.take().is_some() {
            self.backend.discard();
            debug!("Recording cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// cpal backend
// ---------------------------------------------------------------------------

/// Capture settings for the cpal backend.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

/// Live handles for one capture session. Retired wholesale on finalize or
/// discard so a leaked input stream can never write into a later session's
/// buffer or be re-armed by it.
struct ActiveCapture {
    flag: Arc<AtomicBool>,
    samples: Arc<Mutex<Vec<i16>>>,
}

impl ActiveCapture {
    /// Silences the stream permanently and drains the captured samples.
    fn retire(self) -> Vec<i16> {
        self.flag.store(false, Ordering::SeqCst);
        match self.samples.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Microphone backend capturing PCM-16 into a temp WAV artifact.
pub struct CpalRecorder {
    config: CaptureConfig,
    current: Option<ActiveCapture>,
}

impl CpalRecorder {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }
}

impl RecorderBackend for CpalRecorder {
    fn begin(&mut self) -> Result<(), RecordingError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(RecordingError::NoInputDevice)?;

        info!(device = ?device.name(), "Using input device");

        let config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        if let Some(stale) = self.current.take() {
            stale.retire();
        }

        let flag = Arc::new(AtomicBool::new(true));
        let samples = Arc::new(Mutex::new(Vec::new()));
        let active = flag.clone();
        let sink = samples.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !active.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = match sink.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    buf.extend(
                        data.iter()
                            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
                    );
                },
                move |err| {
                    error!("Audio input error: {err}");
                },
                None,
            )
            .map_err(|e| RecordingError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| RecordingError::Device(e.to_string()))?;

        // The stream is leaked; the session's flag is the only control and
        // is never re-armed once retired.
        std::mem::forget(stream);
        self.current = Some(ActiveCapture { flag, samples });

        debug!("Audio capture started");
        Ok(())
    }

    fn finalize(&mut self) -> Result<PathBuf, RecordingError> {
        let session = self.current.take().ok_or(RecordingError::NotRecording)?;
        let samples = session.retire();

        let path = std::env::temp_dir().join(format!("vicinity_voice_{}.wav", uuid::Uuid::new_v4()));
        write_wav(&path, &samples, self.config.sample_rate, self.config.channels)
            .map_err(|e| RecordingError::Finalize(e.to_string()))?;
        Ok(path)
    }

    fn discard(&mut self) {
        if let Some(session) = self.current.take() {
            session.retire();
        }
    }

    fn mime(&self) -> &str {
        "audio/wav"
    }
}

/// Writes PCM-16 LE samples into a minimal RIFF/WAVE container.
fn write_wav(path: &Path, samples: &[i16], sample_rate: u32, channels: u16) -> std::io::Result<()> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * u32::from(channels) * 2;
    let block_align = channels * 2;

    let mut file = std::fs::File::create(path)?;
    file.write_all(b"RIFF")?;
    file.write_all(&(36 + data_len).to_le_bytes())?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?; // PCM
    file.write_all(&channels.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;
    file.write_all(&byte_rate.to_le_bytes())?;
    file.write_all(&block_align.to_le_bytes())?;
    file.write_all(&16u16.to_le_bytes())?; // bits per sample
    file.write_all(b"data")?;
    file.write_all(&data_len.to_le_bytes())?;
    for sample in samples {
        file.write_all(&sample.to_le_bytes())?;
    }
    Ok(())
}
