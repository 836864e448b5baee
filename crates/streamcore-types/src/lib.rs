//! Shared data model for the streaming transcription pipeline: decode results,
//! pipeline configuration, and the tagged error type that crosses crate
//! boundaries between the ring buffer, stabilizer, decoder contract, and
//! scheduler.

use serde::{Deserialize, Serialize};

/// A single recognized token within a [`Segment`], with window-relative
/// timing and a decoder confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub start_time_ms: u32,
    pub end_time_ms: u32,
    pub probability: f32,
}

/// A contiguous span of recognized text from one decode call.
///
/// `tokens` may be empty when the decoder does not expose token-level
/// timing; callers should derive word timing through [`Segment::timing`]
/// rather than matching on `tokens` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub start_ms: u32,
    pub end_ms: u32,
    pub tokens: Vec<Token>,
}

impl Segment {
    pub fn new(text: impl Into<String>, start_ms: u32, end_ms: u32) -> Self {
        Self {
            text: text.into(),
            start_ms,
            end_ms,
            tokens: Vec::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: Vec<Token>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Uniform timing view: per-token when available, else the segment's
    /// own span.
    pub fn timing(&self) -> Timing {
        if self.tokens.is_empty() {
            Timing::PerSegment(self.start_ms, self.end_ms)
        } else {
            Timing::PerToken(self.tokens.clone())
        }
    }
}

/// Resolves the token-level-vs-segment-level timing polymorphism called out
/// in the design notes: a segment either carries its own token list or is
/// timed as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum Timing {
    PerToken(Vec<Token>),
    PerSegment(u32, u32),
}

/// A slice of PCM read from the ring buffer at tick time, tagged with the
/// absolute session timestamps of its first and last sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub pcm: Vec<f32>,
    pub window_start_abs_ms: i64,
    pub window_end_abs_ms: i64,
}

impl Window {
    pub fn empty() -> Self {
        Self {
            pcm: Vec::new(),
            window_start_abs_ms: 0,
            window_end_abs_ms: 0,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.window_end_abs_ms - self.window_start_abs_ms
    }
}

/// The result of one decoder call against one window of audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeResult {
    pub segments: Vec<Segment>,
    pub window_start_abs_ms: i64,
}

impl DecodeResult {
    pub fn empty(window_start_abs_ms: i64) -> Self {
        Self {
            segments: Vec::new(),
            window_start_abs_ms,
        }
    }
}

/// Session-constant tuning surface. All fields are positive; `commit_margin_ms
/// < window_ms` and `tick_ms <= window_ms`. Construct with [`Default`] and
/// adjust, then call [`PipelineConfig::validate`] before starting a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub tick_ms: u32,
    pub window_ms: u32,
    pub commit_margin_ms: u32,
    pub max_prompt_chars: usize,
    pub silence_ms: u32,
    pub no_speech_threshold: f32,
    pub min_token_probability: f32,
    pub max_session_minutes: u32,
    pub sample_rate: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            window_ms: 8_000,
            commit_margin_ms: 700,
            max_prompt_chars: 1_200,
            silence_ms: 900,
            no_speech_threshold: 0.75,
            min_token_probability: 0.30,
            max_session_minutes: 30,
            sample_rate: 16_000,
        }
    }
}

impl PipelineConfig {
    /// Checks the invariants listed in the data model. Called once at
    /// session start; a session never mutates its config afterwards.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("tick_ms", self.tick_ms as i64),
            ("window_ms", self.window_ms as i64),
            ("commit_margin_ms", self.commit_margin_ms as i64),
            ("silence_ms", self.silence_ms as i64),
            ("max_session_minutes", self.max_session_minutes as i64),
            ("sample_rate", self.sample_rate as i64),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.commit_margin_ms >= self.window_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "commit_margin_ms ({}) must be < window_ms ({})",
                self.commit_margin_ms, self.window_ms
            )));
        }
        if self.tick_ms > self.window_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "tick_ms ({}) must be <= window_ms ({})",
                self.tick_ms, self.window_ms
            )));
        }
        Ok(())
    }

    pub fn capacity_samples(&self) -> usize {
        (self.window_ms as u64 * self.sample_rate as u64 / 1_000) as usize
    }
}

/// The single tagged error type that crosses the pipeline boundary, per the
/// error handling design: one variant per disposition, never a bag of
/// opaque strings.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("audio source unavailable: {0}")]
    AudioSourceUnavailable(String),

    #[error("decoder transient error: {0}")]
    DecoderTransient(String),

    #[error("decoder fatal error after {consecutive_failures} consecutive failures: {message}")]
    DecoderFatal {
        consecutive_failures: u32,
        message: String,
    },

    #[error("session duration exceeded {max_session_minutes} minutes")]
    SessionDurationExceeded { max_session_minutes: u32 },

    #[error("finalization failed: {0}")]
    FinalizationFailure(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
