//! Owns the periodic tick, backpressure, and session lifecycle of the
//! streaming transcription pipeline.
//!
//! The pipeline execution context is a single spawned async task owning all
//! mutable state (ring buffer, silence detector, stabilizer), driven by
//! `tokio::select!` over a tick interval, an inbound audio-sample channel,
//! a decode-completion channel, and a cancellation token. This mirrors the
//! bus listener task elsewhere in the workspace: a restartable
//! `CancellationToken` held behind a mutex, a mutex-guarded session state,
//! and a lock-free atomics status snapshot updated from the hot path.

mod status;

pub use status::{PipelineStatus, PipelineStatusSnapshot};

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use streamcore_decoder::{Decoder, DecoderError};
use streamcore_ringbuffer::RingBuffer;
use streamcore_stabilizer::TranscriptStabilizer;
use streamcore_types::{DecodeResult, PipelineConfig, PipelineError};
use streamcore_vad::{SilenceDetector, DEFAULT_RMS_SILENCE_THRESHOLD};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum viable window length; shorter windows are not decoded.
const MIN_WINDOW_MS: i64 = 500;

/// Consecutive transient decoder failures before the session is treated as
/// unrecoverable and stopped.
const CONSECUTIVE_FAILURE_FATAL_THRESHOLD: u32 = 5;

/// `Idle -> Recording -> Transcribing -> Idle`, plus `Error` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Transcribing,
    Error,
}

/// The outcome of a stopped session: the streaming transcript at the moment
/// of finalization plus the authoritative whole-session decode, if it
/// succeeded. When the final decode fails, `final_text` mirrors
/// `committed_text` and `final_text_is_authoritative` is false.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub committed_text: String,
    pub final_text: String,
    pub final_text_is_authoritative: bool,
}

/// Sending half of a session's audio channel. Cloneable so multiple capture
/// callbacks (or a test harness feeding batches of arbitrary size) can push
/// samples; the pipeline task is the sole receiver, so capture callbacks
/// never touch scheduler or stabilizer state directly.
pub type AudioSender = mpsc::Sender<Vec<f32>>;

/// A running session's join handle: awaiting it drives the session to
/// completion and yields its [`SessionResult`].
pub type SessionJoin = tokio::task::JoinHandle<Result<SessionResult, PipelineError>>;

/// Owns the periodic tick and backpressure policy, and drives the ring
/// buffer / silence detector / stabilizer through one recording session.
///
/// Restartable: each `start` creates a fresh child `CancellationToken`, so
/// `stop` followed by `start` works correctly, the same pattern the
/// workspace's own audio-bus listener handle uses.
pub struct PipelineScheduler {
    decoder: Arc<dyn Decoder>,
    config: PipelineConfig,
    status: Arc<PipelineStatus>,
    state: Arc<Mutex<SessionState>>,
    cancel_token: Mutex<CancellationToken>,
}

impl PipelineScheduler {
    /// Validates `config`'s invariants before constructing the scheduler;
    /// an invalid config never reaches `Recording`.
    pub fn new(decoder: Arc<dyn Decoder>, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            decoder,
            config,
            status: Arc::new(PipelineStatus::new()),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            cancel_token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// The scheduler's current position in `Idle -> Recording ->
    /// Transcribing -> Idle` (or `Error` from any state).
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), SessionState::Recording | SessionState::Transcribing)
    }

    /// Cancels the periodic timer and marks the session terminating. The
    /// spawned task drains any in-flight decode, finalizes, and resolves
    /// its `SessionJoin` rather than being killed outright.
    pub fn stop(&self) {
        if let Ok(token) = self.cancel_token.lock() {
            token.cancel();
        }
    }

    /// Starts a new recording session: `Idle -> Recording`. `on_update` is
    /// invoked with `(committed, speculative)` after every stabilizer
    /// update, on the pipeline task. Returns a sender for pushing audio
    /// batches of arbitrary size and a join handle for the eventual
    /// [`SessionResult`].
    pub fn start<F>(&self, on_update: F) -> (AudioSender, SessionJoin)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let child_token = {
            let mut guard = self.cancel_token.lock().unwrap();
            let fresh = CancellationToken::new();
            let child = fresh.child_token();
            *guard = fresh;
            child
        };
        *self.state.lock().unwrap() = SessionState::Recording;
        self.status.reset();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>(64);
        let config = self.config;
        let decoder = Arc::clone(&self.decoder);
        let status = Arc::clone(&self.status);
        let state = Arc::clone(&self.state);

        let join = tokio::spawn(async move {
            let result =
                run_session(config, decoder, status, audio_rx, child_token, &state, on_update)
                    .await;
            *state.lock().unwrap() = match &result {
                Ok(_) => SessionState::Idle,
                Err(_) => SessionState::Error,
            };
            result
        });

        (audio_tx, join)
    }
}

/// One completed (or failed) decode, tagged with the window it was
/// dispatched against so the stabilizer sees the horizon that tick used
/// rather than whatever the ring buffer has grown to by completion time.
struct DecodeOutcome {
    window_end_abs_ms: i64,
    decode: Result<DecodeResult, DecoderError>,
    duration: Duration,
}

enum StopReason {
    Cancelled,
    AudioSourceClosed,
    DecoderFatal(String),
    SessionDurationExceeded,
}

#[allow(clippy::too_many_arguments)]
async fn run_session<F>(
    config: PipelineConfig,
    decoder: Arc<dyn Decoder>,
    status: Arc<PipelineStatus>,
    mut audio_rx: mpsc::Receiver<Vec<f32>>,
    cancel_token: CancellationToken,
    state: &Mutex<SessionState>,
    on_update: F,
) -> Result<SessionResult, PipelineError>
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    tracing::info!(tick_ms = config.tick_ms, window_ms = config.window_ms, "pipeline_session_start");

    let mut ring = RingBuffer::new(config.capacity_samples(), config.sample_rate);
    let mut silence = SilenceDetector::new(DEFAULT_RMS_SILENCE_THRESHOLD, config.silence_ms);
    let mut stabilizer = TranscriptStabilizer::new();
    let mut full_audio: Vec<f32> = Vec::new();

    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_ms as u64));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let (decode_tx, mut decode_rx) = mpsc::channel::<DecodeOutcome>(1);
    let mut in_flight = false;
    let mut pending_tick = false;
    let mut consecutive_transient_failures: u32 = 0;
    let session_deadline =
        Instant::now() + Duration::from_secs(config.max_session_minutes as u64 * 60);

    let stop_reason = loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                break StopReason::Cancelled;
            }

            audio = audio_rx.recv() => {
                match audio {
                    Some(samples) => {
                        ring.append(&samples);
                        full_audio.extend_from_slice(&samples);
                    }
                    None => break StopReason::AudioSourceClosed,
                }
            }

            outcome = decode_rx.recv(), if in_flight => {
                let Some(outcome) = outcome else { continue };
                in_flight = false;
                status.set_last_decode_duration_ms(outcome.duration.as_millis() as u64);

                match outcome.decode {
                    Ok(result) => {
                        consecutive_transient_failures = 0;
                        status.increment_decodes_completed();
                        stabilizer.update(
                            &result,
                            outcome.window_end_abs_ms,
                            config.commit_margin_ms,
                            config.min_token_probability,
                        );
                        status.set_last_commit_cursor_abs_ms(stabilizer.commit_cursor_abs_ms());
                        on_update(&stabilizer.committed_text(), &stabilizer.speculative_text());

                        // A queued tick rides in on this decode's completion
                        // rather than waiting for the timer to fire again.
                        if pending_tick {
                            pending_tick = false;
                            dispatch_tick(&ring, &mut silence, &stabilizer, &config, &decoder, &status, &decode_tx, &mut in_flight);
                        }
                    }
                    Err(DecoderError::Transient(message)) => {
                        status.increment_decodes_failed();
                        consecutive_transient_failures += 1;
                        tracing::warn!(message = %message, consecutive_transient_failures, "decoder_transient_error");
                        if consecutive_transient_failures >= CONSECUTIVE_FAILURE_FATAL_THRESHOLD {
                            break StopReason::DecoderFatal(format!(
                                "{consecutive_transient_failures} consecutive transient failures: {message}"
                            ));
                        }
                        // Drop this tick's output and any queued tick; the
                        // next timer firing runs against a larger window
                        // rather than retrying in place.
                        pending_tick = false;
                    }
                    Err(DecoderError::Fatal(message)) => {
                        status.increment_decodes_failed();
                        break StopReason::DecoderFatal(message);
                    }
                }
            }

            _ = tick.tick() => {
                status.increment_ticks_processed();
                if Instant::now() >= session_deadline {
                    break StopReason::SessionDurationExceeded;
                }
                if in_flight {
                    if pending_tick {
                        status.increment_dropped_ticks();
                    } else {
                        pending_tick = true;
                    }
                } else {
                    dispatch_tick(&ring, &mut silence, &stabilizer, &config, &decoder, &status, &decode_tx, &mut in_flight);
                }
            }
        }
    };

    // Recording has stopped; only the finalization decode runs from here.
    *state.lock().unwrap() = SessionState::Transcribing;

    // Drain: an in-flight decode is allowed to complete rather than be
    // cancelled, since the trait exposes a plain `async fn` future already
    // polled on this task.
    if in_flight {
        if let Some(outcome) = decode_rx.recv().await {
            status.set_last_decode_duration_ms(outcome.duration.as_millis() as u64);
            if let Ok(result) = outcome.decode {
                status.increment_decodes_completed();
                stabilizer.update(
                    &result,
                    outcome.window_end_abs_ms,
                    config.commit_margin_ms,
                    config.min_token_probability,
                );
                status.set_last_commit_cursor_abs_ms(stabilizer.commit_cursor_abs_ms());
                on_update(&stabilizer.committed_text(), &stabilizer.speculative_text());
            } else {
                status.increment_decodes_failed();
            }
        }
    }

    if matches!(stop_reason, StopReason::SessionDurationExceeded) {
        tracing::info!(
            max_session_minutes = config.max_session_minutes,
            "session_duration_exceeded_forcing_clean_stop"
        );
    }

    let session_error = match stop_reason {
        StopReason::Cancelled | StopReason::SessionDurationExceeded => None,
        StopReason::AudioSourceClosed => {
            Some(PipelineError::AudioSourceUnavailable(
                "audio channel closed before the session was stopped".into(),
            ))
        }
        StopReason::DecoderFatal(message) => Some(PipelineError::DecoderFatal {
            consecutive_failures: consecutive_transient_failures,
            message,
        }),
    };

    if let Some(ref err) = session_error {
        tracing::error!(error = %err, "pipeline_session_error");
    }

    stabilizer.finalize_all();
    on_update(&stabilizer.committed_text(), &stabilizer.speculative_text());

    let streaming_result = stabilizer.committed_text();
    let (final_text, final_text_is_authoritative) = match decoder.transcribe_full(&full_audio).await {
        Ok(text) => (text, true),
        Err(err) => {
            let finalization_err = PipelineError::FinalizationFailure(err.to_string());
            tracing::warn!(error = %finalization_err, "falling_back_to_streaming_result");
            (streaming_result.clone(), false)
        }
    };

    tracing::info!(
        committed_chars = streaming_result.chars().count(),
        final_chars = final_text.chars().count(),
        "pipeline_session_end"
    );

    if let Some(err) = session_error {
        return Err(err);
    }

    Ok(SessionResult {
        committed_text: streaming_result,
        final_text,
        final_text_is_authoritative,
    })
}

/// Reads the current window, applies the silence skip policy, builds the
/// prompt, and dispatches a decode as a background task reporting back
/// through `decode_tx`. A no-op if the window is too short or silent;
/// `in_flight` is only set to `true` when a decode was actually dispatched.
#[allow(clippy::too_many_arguments)]
fn dispatch_tick(
    ring: &RingBuffer,
    silence: &mut SilenceDetector,
    stabilizer: &TranscriptStabilizer,
    config: &PipelineConfig,
    decoder: &Arc<dyn Decoder>,
    status: &Arc<PipelineStatus>,
    decode_tx: &mpsc::Sender<DecodeOutcome>,
    in_flight: &mut bool,
) {
    let window = ring.window();
    if window.duration_ms() < MIN_WINDOW_MS {
        return;
    }

    if silence.update(&window.pcm, window.window_end_abs_ms) {
        status.increment_silent_ticks();
        tracing::debug!(window_end_abs_ms = window.window_end_abs_ms, "silent_tick");
        return;
    }

    let prompt = build_prompt(&stabilizer.committed_text(), config.max_prompt_chars);

    tracing::debug!(
        window_start_abs_ms = window.window_start_abs_ms,
        window_end_abs_ms = window.window_end_abs_ms,
        prompt_chars = prompt.as_ref().map(|p| p.chars().count()).unwrap_or(0),
        "decode_dispatch"
    );

    *in_flight = true;
    status.increment_decodes_dispatched();

    let decoder = Arc::clone(decoder);
    let decode_tx = decode_tx.clone();
    let window_start_abs_ms = window.window_start_abs_ms;
    let window_end_abs_ms = window.window_end_abs_ms;
    let pcm = window.pcm;

    tokio::spawn(async move {
        let started = Instant::now();
        let decode = decoder
            .transcribe_window(&pcm, window_start_abs_ms, prompt.as_deref())
            .await;
        let _ = decode_tx
            .send(DecodeOutcome {
                window_end_abs_ms,
                decode,
                duration: started.elapsed(),
            })
            .await;
    });
}

/// Builds the decoder prompt from the committed-text tail: verbatim if it
/// fits, otherwise the trailing `max_prompt_chars` trimmed forward to the
/// first `". "` boundary (falling back to the first space) so a word is
/// never split. `max_prompt_chars == 0` always yields `None`.
fn build_prompt(committed_text: &str, max_prompt_chars: usize) -> Option<String> {
    if max_prompt_chars == 0 || committed_text.is_empty() {
        return None;
    }

    let char_count = committed_text.chars().count();
    if char_count <= max_prompt_chars {
        return Some(committed_text.to_string());
    }

    let skip = char_count - max_prompt_chars;
    let suffix: String = committed_text.chars().skip(skip).collect();

    if let Some(idx) = suffix.find(". ") {
        Some(suffix[idx + 2..].to_string())
    } else if let Some(idx) = suffix.find(' ') {
        Some(suffix[idx + 1..].to_string())
    } else {
        Some(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamcore_decoder::ScriptedDecoder;
    use streamcore_types::Segment;

    fn config() -> PipelineConfig {
        PipelineConfig {
            tick_ms: 50,
            window_ms: 2_000,
            commit_margin_ms: 300,
            max_prompt_chars: 1_200,
            silence_ms: 200,
            no_speech_threshold: 0.75,
            min_token_probability: 0.30,
            max_session_minutes: 30,
            sample_rate: 16_000,
        }
    }

    fn loud_samples(n: usize) -> Vec<f32> {
        (0..n).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect()
    }

    #[test]
    fn prompt_is_verbatim_when_within_budget() {
        assert_eq!(
            build_prompt("hello world", 100),
            Some("hello world".to_string())
        );
    }

    #[test]
    fn prompt_is_none_when_max_chars_is_zero() {
        assert_eq!(build_prompt("hello world", 0), None);
    }

    #[test]
    fn prompt_is_none_for_empty_committed_text() {
        assert_eq!(build_prompt("", 100), None);
    }

    #[test]
    fn prompt_trims_to_sentence_boundary_when_over_budget() {
        let committed = "First sentence here. Second sentence continues longer than budget allows.";
        let prompt = build_prompt(committed, 30).unwrap();
        assert!(!prompt.is_empty());
        assert!(committed.ends_with(&prompt));
        assert!(!prompt.starts_with(' '));
    }

    #[test]
    fn prompt_falls_back_to_space_boundary_without_sentence_terminator() {
        let committed = "aaaaaaaaaa bbbbbbbbbb cccccccccc dddddddddd";
        let prompt = build_prompt(committed, 15).unwrap();
        assert!(committed.ends_with(&prompt));
        assert!(!prompt.starts_with(' '));
    }

    #[tokio::test(start_paused = true)]
    async fn short_utterance_commits_and_finalizes() {
        let decoder = Arc::new(
            ScriptedDecoder::new()
                .push_window_result(Ok(DecodeResult {
                    segments: vec![Segment::new("the quick brown", 0, 1_500)],
                    window_start_abs_ms: 0,
                }))
                .push_full_result(Ok("The quick brown fox.".to_string())),
        );
        let scheduler = PipelineScheduler::new(decoder, config()).unwrap();
        let updates = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let updates_clone = Arc::clone(&updates);
        let (audio_tx, join) = scheduler.start(move |committed, speculative| {
            updates_clone
                .lock()
                .unwrap()
                .push((committed.to_string(), speculative.to_string()));
        });

        audio_tx.send(loud_samples(16_000 * 2)).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(60)).await;
        }

        scheduler.stop();
        let result = join.await.unwrap().unwrap();
        assert!(result.final_text_is_authoritative);
        assert_eq!(result.final_text, "The quick brown fox.");
        assert!(!updates.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_only_session_issues_no_decodes() {
        let decoder = Arc::new(ScriptedDecoder::new().push_full_result(Ok(String::new())));
        let scheduler = PipelineScheduler::new(decoder, config()).unwrap();
        let (audio_tx, join) = scheduler.start(|_, _| {});

        // Continuous silent capture: a real microphone keeps streaming
        // zero-amplitude samples, which is what advances the window's
        // absolute end time and lets sustained silence actually accrue.
        for _ in 0..10 {
            audio_tx.send(vec![0.0; 16_000 * 50 / 1_000]).await.unwrap();
            tokio::time::advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
        }

        let status = scheduler.status();
        scheduler.stop();
        let result = join.await.unwrap().unwrap();
        assert_eq!(result.committed_text, "");
        assert_eq!(status.decodes_dispatched(), 0);
        assert!(status.silent_ticks() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_caps_one_in_flight_and_one_queued() {
        let decoder = Arc::new(
            ScriptedDecoder::new()
                .with_delay(Duration::from_millis(200))
                .push_full_result(Ok(String::new())),
        );
        let scheduler = PipelineScheduler::new(decoder, config()).unwrap();
        let status = scheduler.status();
        let (audio_tx, join) = scheduler.start(|_, _| {});

        audio_tx.send(loud_samples(16_000 * 2)).await.unwrap();
        for _ in 0..8 {
            tokio::time::advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
        }

        assert!(status.dropped_ticks() > 0);
        scheduler.stop();
        join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn audio_source_closing_reports_unavailable_error() {
        let decoder = Arc::new(ScriptedDecoder::new());
        let scheduler = PipelineScheduler::new(decoder, config()).unwrap();
        let (audio_tx, join) = scheduler.start(|_, _| {});
        drop(audio_tx);

        let result = join.await.unwrap();
        assert!(matches!(result, Err(PipelineError::AudioSourceUnavailable(_))));
    }
}
