//! The pipeline's sole dependency on speech recognition: an object-safe
//! async trait contract plus a deterministic scripted mock used by tests.
//! No concrete recognition engine is implemented here — the engine itself
//! is an external collaborator with a thin contract.

use async_trait::async_trait;
use std::sync::Mutex;
use streamcore_types::DecodeResult;

/// Errors the decoder may report. Transient errors are non-fatal to the
/// session; the scheduler counts consecutive transient errors and escalates
/// to a fatal condition itself (see the scheduler crate) rather than the
/// decoder self-reporting fatality from a single call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecoderError {
    #[error("decoder busy or resource-starved: {0}")]
    Transient(String),
    #[error("decoder unrecoverable failure: {0}")]
    Fatal(String),
}

/// The pipeline's view of a speech-recognition engine.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decodes one window of PCM at the configured sample rate.
    ///
    /// `window_start_abs_ms` is the absolute session offset of `frames[0]`;
    /// `prompt` is the committed-text tail used as decoder context.
    async fn transcribe_window(
        &self,
        frames: &[f32],
        window_start_abs_ms: i64,
        prompt: Option<&str>,
    ) -> Result<DecodeResult, DecoderError>;

    /// Single-shot, whole-session decode used only at finalization.
    async fn transcribe_full(&self, frames: &[f32]) -> Result<String, DecoderError>;
}

/// A scripted decoder for tests: returns queued results/errors in order,
/// optionally sleeping before each call to simulate a slow engine.
pub struct ScriptedDecoder {
    window_script: Mutex<Vec<Result<DecodeResult, DecoderError>>>,
    full_script: Mutex<Vec<Result<String, DecoderError>>>,
    call_delay: Option<std::time::Duration>,
    window_calls: Mutex<Vec<(i64, Option<String>)>>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self {
            window_script: Mutex::new(Vec::new()),
            full_script: Mutex::new(Vec::new()),
            call_delay: None,
            window_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Queues a `transcribe_window` response, consumed front-to-back.
    pub fn push_window_result(self, result: Result<DecodeResult, DecoderError>) -> Self {
        self.window_script.lock().unwrap().push(result);
        self
    }

    pub fn push_full_result(self, result: Result<String, DecoderError>) -> Self {
        self.full_script.lock().unwrap().push(result);
        self
    }

    /// The `(window_start_abs_ms, prompt)` pairs this decoder was invoked
    /// with, in call order — for asserting prompt construction in tests.
    pub fn recorded_window_calls(&self) -> Vec<(i64, Option<String>)> {
        self.window_calls.lock().unwrap().clone()
    }
}

impl Default for ScriptedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decoder for ScriptedDecoder {
    async fn transcribe_window(
        &self,
        _frames: &[f32],
        window_start_abs_ms: i64,
        prompt: Option<&str>,
    ) -> Result<DecodeResult, DecoderError> {
        self.window_calls
            .lock()
            .unwrap()
            .push((window_start_abs_ms, prompt.map(String::from)));
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.window_script.lock().unwrap();
        if script.is_empty() {
            return Ok(DecodeResult::empty(window_start_abs_ms));
        }
        script.remove(0)
    }

    async fn transcribe_full(&self, _frames: &[f32]) -> Result<String, DecoderError> {
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.full_script.lock().unwrap();
        if script.is_empty() {
            return Ok(String::new());
        }
        script.remove(0)
    }
}
