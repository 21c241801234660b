// Voice capture and playback for the proximity chat client.

pub mod capture;
pub mod playback;

pub use capture::{
    CpalRecorder, RecorderBackend, RecordingError, VoiceArtifact, VoicePayload, VoiceRecorder,
};
pub use playback::{
    resolve_source, AudioSink, CpalSink, PlaybackAction, PlaybackError, PlaybackManager,
    ResolvedSource,
};
