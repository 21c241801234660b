//! Voice playback: tap-to-toggle, single active clip at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use vicinity_shared::types::{AudioRef, MessageIdentity, VoiceMessage};

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("Invalid audio payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("Failed to fetch audio: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// A playable source after URL resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Absolute URL on the chat server.
    Remote(String),
    /// `data:` URI carrying the clip inline.
    DataUri(String),
}

/// Resolves a message's audio reference against the server base URL.
/// Hosted URLs win over inline payloads; inline payloads become data URIs.
pub fn resolve_source(audio: &AudioRef, server_base: &str) -> ResolvedSource {
    match audio {
        AudioRef::RemoteUrl(url) => {
            if url.starts_with("http://") || url.starts_with("https://") {
                ResolvedSource::Remote(url.clone())
            } else {
                let base = server_base.trim_end_matches('/');
                let path = if url.starts_with('/') {
                    url.clone()
                } else {
                    format!("/{url}")
                };
                ResolvedSource::Remote(format!("{base}{path}"))
            }
        }
        AudioRef::InlinePayload { data, .. } => {
            ResolvedSource::DataUri(format!("data:{};base64,{}", audio.mime(), data))
        }
    }
}

/// Device seam for playback. `done` fires when the clip plays to its end;
/// it is dropped without firing when playback is stopped early.
#[allow(async_fn_in_trait)]
pub trait AudioSink: Send {
    async fn start(
        &mut self,
        source: &ResolvedSource,
        done: oneshot::Sender<()>,
    ) -> Result<(), PlaybackError>;

    fn stop(&mut self);
}

/// What a toggle request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackAction {
    Started,
    Stopped,
}

/// Tap-to-toggle playback over a single sink. Tapping the playing message
/// stops it; tapping another message replaces the active clip.
pub struct PlaybackManager<S: AudioSink> {
    sink: S,
    server_base: String,
    active: Arc<Mutex<Option<MessageIdentity>>>,
    finished_tx: mpsc::Sender<MessageIdentity>,
}

impl<S: AudioSink> PlaybackManager<S> {
    /// The receiver yields the identity of each clip that plays to
    /// completion, so the UI can clear its playing indicator.
    pub fn new(sink: S, server_base: impl Into<String>) -> (Self, mpsc::Receiver<MessageIdentity>) {
        let (finished_tx, finished_rx) = mpsc::channel(16);
        (
            Self {
                sink,
                server_base: server_base.into(),
                active: Arc::new(Mutex::new(None)),
                finished_tx,
            },
            finished_rx,
        )
    }

    pub fn playing(&self) -> Option<MessageIdentity> {
        lock_active(&self.active).clone()
    }

    /// Toggles playback of a voice message.
    pub async fn toggle(&mut self, message: &VoiceMessage) -> Result<PlaybackAction, PlaybackError> {
        let identity = message.identity();
        let prior = lock_active(&self.active).take();

        if prior.is_some() {
            self.sink.stop();
        }
        if prior.as_ref() == Some(&identity) {
            debug!(message = %identity, "Playback stopped");
            return Ok(PlaybackAction::Stopped);
        }

        let source = resolve_source(&message.audio, &self.server_base);
        let (done_tx, done_rx) = oneshot::channel();
        if let Err(e) = self.sink.start(&source, done_tx).await {
            error!(message = %identity, error = %e, "Playback failed");
            self.sink.stop();
            return Err(e);
        }

        *lock_active(&self.active) = Some(identity.clone());
        debug!(message = %identity, "Playback started");

        let active = self.active.clone();
        let finished_tx = self.finished_tx.clone();
        let watched = identity;
        tokio::spawn(async move {
            // Err means the clip was stopped or replaced, not finished.
            if done_rx.await.is_ok() {
                let finished = {
                    let mut slot = lock_active(&active);
                    if slot.as_ref() == Some(&watched) {
                        *slot = None;
                        true
                    } else {
                        false
                    }
                };
                if finished {
                    let _ = finished_tx.send(watched).await;
                }
            }
        });

        Ok(PlaybackAction::Started)
    }

    /// Stops whatever is playing. Safe to call when nothing is.
    pub fn stop(&mut self) {
        if lock_active(&self.active).take().is_some() {
            self.sink.stop();
        }
    }
}

fn lock_active(
    active: &Arc<Mutex<Option<MessageIdentity>>>,
) -> std::sync::MutexGuard<'_, Option<MessageIdentity>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// cpal sink
// ---------------------------------------------------------------------------

/// Output sink decoding clips with symphonia and playing them via cpal.
///
/// Each started stream gets its own silencing flag. Stopping retires the
/// flag permanently, so a leaked stream from an earlier clip can never be
/// re-armed by a later start.
pub struct CpalSink {
    http: reqwest::Client,
    active: Option<Arc<AtomicBool>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            active: None,
        }
    }

    async fn fetch_bytes(&self, source: &ResolvedSource) -> Result<Vec<u8>, PlaybackError> {
        match source {
            ResolvedSource::Remote(url) => {
                let resp = self.http.get(url).send().await?;
                let resp = resp.error_for_status()?;
                Ok(resp.bytes().await?.to_vec())
            }
            ResolvedSource::DataUri(uri) => parse_data_uri(uri),
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    async fn start(
        &mut self,
        source: &ResolvedSource,
        done: oneshot::Sender<()>,
    ) -> Result<(), PlaybackError> {
        let bytes = self.fetch_bytes(source).await?;
        let decoded = decode_clip(&bytes)?;

        self.stop();
        let active = Arc::new(AtomicBool::new(true));
        play_samples(decoded, active.clone(), done)?;
        self.active = Some(active);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(flag) = self.active.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Extracts the base64 payload of a `data:` URI.
fn parse_data_uri(uri: &str) -> Result<Vec<u8>, PlaybackError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| PlaybackError::InvalidPayload("not a data URI".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| PlaybackError::InvalidPayload("data URI missing payload".into()))?;
    if !meta.ends_with(";base64") {
        return Err(PlaybackError::InvalidPayload(
            "data URI is not base64-encoded".into(),
        ));
    }
    BASE64
        .decode(payload)
        .map_err(|e| PlaybackError::InvalidPayload(e.to_string()))
}

struct DecodedClip {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

/// Decodes a clip into interleaved PCM-16 using symphonia.
fn decode_clip(bytes: &[u8]) -> Result<DecodedClip, PlaybackError> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PlaybackError::Unsupported(e.to_string()))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| PlaybackError::Unsupported("no audio track".into()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PlaybackError::Unsupported(e.to_string()))?;

    let mut samples = Vec::new();
    let mut sample_rate = 0;
    let mut channels = 0u16;
    let mut buffer: Option<SampleBuffer<i16>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(symphonia::core::errors::Error::ResetRequired) => break,
            Err(e) => return Err(PlaybackError::Unsupported(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(PlaybackError::Unsupported(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let buf = buffer.get_or_insert_with(|| {
            SampleBuffer::<i16>::new(decoded.capacity() as u64, spec)
        });
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    if samples.is_empty() {
        return Err(PlaybackError::Unsupported("clip decoded to no audio".into()));
    }

    Ok(DecodedClip {
        samples,
        sample_rate,
        channels,
    })
}

/// Streams decoded PCM to the default output device. Fires `done` when the
/// queue drains; the active flag silences the callback when stopped early.
fn play_samples(
    clip: DecodedClip,
    active: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
) -> Result<(), PlaybackError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    let config = cpal::StreamConfig {
        channels: clip.channels.max(1),
        sample_rate: cpal::SampleRate(clip.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut queue: VecDeque<i16> = clip.samples.into();
    let mut done = Some(done);

    let stream = device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for slot in out.iter_mut() {
                    if !active.load(Ordering::Relaxed) {
                        *slot = 0.0;
                        continue;
                    }
                    match queue.pop_front() {
                        Some(sample) => *slot = f32::from(sample) / 32768.0,
                        None => {
                            *slot = 0.0;
                            if let Some(tx) = done.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                }
            },
            move |err| {
                error!("Audio output error: {err}");
            },
            None,
        )
        .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    // The stream is leaked; its per-clip flag is the only control and is
    // never re-armed once cleared.
    std::mem::forget(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vicinity_shared::types::UserId;

    fn voice(ts_secs: i64, user: &str, audio: AudioRef) -> VoiceMessage {
        VoiceMessage {
            user_id: UserId(user.into()),
            name: format!("{user}-name"),
            audio,
            duration_secs: 3,
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
        }
    }

    #[test]
    fn hosted_url_is_resolved_against_the_server_base() {
        let audio = AudioRef::RemoteUrl("/uploads/clip.webm".into());
        assert_eq!(
            resolve_source(&audio, "http://example.com/"),
            ResolvedSource::Remote("http://example.com/uploads/clip.webm".into())
        );

        let bare = AudioRef::RemoteUrl("uploads/clip.webm".into());
        assert_eq!(
            resolve_source(&bare, "http://example.com"),
            ResolvedSource::Remote("http://example.com/uploads/clip.webm".into())
        );
    }

    #[test]
    fn absolute_url_passes_through_unchanged() {
        let audio = AudioRef::RemoteUrl("https://cdn.example.com/clip.webm".into());
        assert_eq!(
            resolve_source(&audio, "http://example.com"),
            ResolvedSource::Remote("https://cdn.example.com/clip.webm".into())
        );
    }

    #[test]
    fn inline_payload_becomes_a_data_uri_with_default_mime() {
        let audio = AudioRef::InlinePayload {
            data: "AAAA".into(),
            mime: None,
        };
        assert_eq!(
            resolve_source(&audio, "http://example.com"),
            ResolvedSource::DataUri("data:audio/webm;base64,AAAA".into())
        );

        let tagged = AudioRef::InlinePayload {
            data: "AAAA".into(),
            mime: Some("audio/wav".into()),
        };
        assert_eq!(
            resolve_source(&tagged, "http://example.com"),
            ResolvedSource::DataUri("data:audio/wav;base64,AAAA".into())
        );
    }

    #[test]
    fn data_uri_payload_round_trips() {
        let bytes = parse_data_uri("data:audio/webm;base64,AQID").unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        assert!(parse_data_uri("http://example.com/x").is_err());
        assert!(parse_data_uri("data:audio/webm;base64").is_err());
        assert!(parse_data_uri("data:audio/webm,plain").is_err());
    }

    #[derive(Default)]
    struct MockSink {
        starts: Vec<ResolvedSource>,
        stops: u32,
        fail_next: bool,
        done: Option<oneshot::Sender<()>>,
    }

    impl AudioSink for MockSink {
        async fn start(
            &mut self,
            source: &ResolvedSource,
            done: oneshot::Sender<()>,
        ) -> Result<(), PlaybackError> {
            if self.fail_next {
                return Err(PlaybackError::Unsupported("mock".into()));
            }
            self.starts.push(source.clone());
            self.done = Some(done);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
            self.done = None;
        }
    }

    #[test]
    fn sink_stop_retires_the_stream_flag_for_good() {
        let mut sink = CpalSink::new();
        let first = Arc::new(AtomicBool::new(true));
        sink.active = Some(first.clone());

        sink.stop();
        assert!(!first.load(Ordering::SeqCst));
        assert!(sink.active.is_none());

        // Arming the next clip's flag must leave the retired one silenced.
        let second = Arc::new(AtomicBool::new(true));
        sink.active = Some(second.clone());
        assert!(!first.load(Ordering::SeqCst));

        sink.stop();
        assert!(!second.load(Ordering::SeqCst));
        assert!(!first.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tapping_the_playing_message_stops_it() {
        let (mut manager, _finished) = PlaybackManager::new(MockSink::default(), "http://s");
        let msg = voice(100, "u-1", AudioRef::RemoteUrl("/a.webm".into()));

        assert_eq!(manager.toggle(&msg).await.unwrap(), PlaybackAction::Started);
        assert_eq!(manager.playing(), Some(msg.identity()));

        assert_eq!(manager.toggle(&msg).await.unwrap(), PlaybackAction::Stopped);
        assert_eq!(manager.playing(), None);
        assert_eq!(manager.sink.stops, 1);
        assert_eq!(manager.sink.starts.len(), 1);
    }

    #[tokio::test]
    async fn tapping_another_message_replaces_the_active_clip() {
        let (mut manager, _finished) = PlaybackManager::new(MockSink::default(), "http://s");
        let first = voice(100, "u-1", AudioRef::RemoteUrl("/a.webm".into()));
        let second = voice(200, "u-2", AudioRef::RemoteUrl("/b.webm".into()));

        manager.toggle(&first).await.unwrap();
        assert_eq!(
            manager.toggle(&second).await.unwrap(),
            PlaybackAction::Started
        );
        assert_eq!(manager.playing(), Some(second.identity()));
        assert_eq!(manager.sink.stops, 1);
        assert_eq!(manager.sink.starts.len(), 2);
    }

    #[tokio::test]
    async fn natural_completion_clears_state_and_reports_the_message() {
        let (mut manager, mut finished) = PlaybackManager::new(MockSink::default(), "http://s");
        let msg = voice(100, "u-1", AudioRef::RemoteUrl("/a.webm".into()));

        manager.toggle(&msg).await.unwrap();
        let done = manager.sink.done.take().unwrap();
        done.send(()).unwrap();

        let ended = finished.recv().await.unwrap();
        assert_eq!(ended, msg.identity());
        assert_eq!(manager.playing(), None);
    }

    #[tokio::test]
    async fn early_stop_does_not_report_completion() {
        let (mut manager, mut finished) = PlaybackManager::new(MockSink::default(), "http://s");
        let msg = voice(100, "u-1", AudioRef::RemoteUrl("/a.webm".into()));

        manager.toggle(&msg).await.unwrap();
        manager.stop();
        assert_eq!(manager.playing(), None);

        // Sender was dropped by the sink's stop, so no completion arrives.
        assert!(finished.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_failed_start_leaves_nothing_playing() {
        let (mut manager, _finished) = PlaybackManager::new(MockSink::default(), "http://s");
        manager.sink.fail_next = true;
        let msg = voice(100, "u-1", AudioRef::RemoteUrl("/a.webm".into()));

        assert!(manager.toggle(&msg).await.is_err());
        assert_eq!(manager.playing(), None);

        // The manager stays usable after a failure.
        manager.sink.fail_next = false;
        assert_eq!(manager.toggle(&msg).await.unwrap(), PlaybackAction::Started);
    }
}
