//! Re-exports the public surface of the streaming transcription pipeline as
//! one crate, mirroring the workspace's own `application`-crate re-export
//! pattern: consumers depend on `streamcore` rather than reaching into each
//! of the five component crates individually.

pub use streamcore_decoder::{Decoder, DecoderError, ScriptedDecoder};
pub use streamcore_ringbuffer::RingBuffer;
pub use streamcore_scheduler::{
    AudioSender, PipelineScheduler, PipelineStatus, PipelineStatusSnapshot, SessionJoin,
    SessionResult, SessionState,
};
pub use streamcore_stabilizer::TranscriptStabilizer;
pub use streamcore_types::{
    DecodeResult, PipelineConfig, PipelineError, Result, Segment, Timing, Token, Window,
};
pub use streamcore_vad::{SilenceDetector, DEFAULT_RMS_SILENCE_THRESHOLD};
