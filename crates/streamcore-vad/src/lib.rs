//! A stateful RMS-energy voice-activity detector.
//!
//! Unlike an ML-based detector, this reports only a single boolean signal —
//! "energy has stayed below threshold for at least `silence_ms`" — which the
//! scheduler uses to skip decodes that would likely hallucinate on silence.
//! It does not attempt end-of-utterance or turn-taking detection.

/// Default RMS amplitude below which a window is treated as silence. Tuned
/// for normalized `[-1.0, 1.0]` float PCM; quiet room tone and mic noise
/// floor typically sit well under this.
pub const DEFAULT_RMS_SILENCE_THRESHOLD: f32 = 0.01;

/// Tracks onset of sustained silence by RMS energy threshold.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    silence_ms: u32,
    silence_start_abs_ms: Option<i64>,
}

impl SilenceDetector {
    pub fn new(threshold: f32, silence_ms: u32) -> Self {
        Self {
            threshold,
            silence_ms,
            silence_start_abs_ms: None,
        }
    }

    /// Feeds a batch of samples ending at `current_abs_ms`. Returns true iff
    /// energy has now stayed below `threshold` for at least `silence_ms`.
    pub fn update(&mut self, samples: &[f32], current_abs_ms: i64) -> bool {
        let rms = rms(samples);
        if rms < self.threshold {
            match self.silence_start_abs_ms {
                None => {
                    self.silence_start_abs_ms = Some(current_abs_ms);
                    tracing::trace!(current_abs_ms, rms, "silence_onset");
                    false
                }
                Some(start) => {
                    let sustained = current_abs_ms - start >= self.silence_ms as i64;
                    if sustained {
                        tracing::debug!(
                            silence_start_abs_ms = start,
                            current_abs_ms,
                            "sustained_silence"
                        );
                    }
                    sustained
                }
            }
        } else {
            self.silence_start_abs_ms = None;
            false
        }
    }

    pub fn is_silent_now(&self) -> bool {
        self.silence_start_abs_ms.is_some()
    }

    pub fn silence_start_abs_ms(&self) -> Option<i64> {
        self.silence_start_abs_ms
    }

    pub fn reset(&mut self) {
        self.silence_start_abs_ms = None;
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    fn loud(n: usize) -> Vec<f32> {
        vec![1.0; n]
    }

    #[test]
    fn loud_samples_never_signal_silence() {
        let mut det = SilenceDetector::new(0.1, 900);
        assert!(!det.update(&loud(160), 0));
        assert!(!det.update(&loud(160), 10_000));
    }

    #[test]
    fn silence_below_threshold_duration_does_not_signal() {
        let mut det = SilenceDetector::new(0.1, 900);
        assert!(!det.update(&silence(160), 0));
        assert!(!det.update(&silence(160), 500));
        assert!(det.is_silent_now());
    }

    #[test]
    fn sustained_silence_signals_true_at_threshold() {
        let mut det = SilenceDetector::new(0.1, 900);
        assert!(!det.update(&silence(160), 0));
        assert!(det.update(&silence(160), 900));
    }

    #[test]
    fn loud_sample_clears_silence_onset() {
        let mut det = SilenceDetector::new(0.1, 900);
        assert!(!det.update(&silence(160), 0));
        assert!(!det.update(&loud(160), 400));
        assert!(!det.is_silent_now());
        assert!(!det.update(&silence(160), 900));
    }

    #[test]
    fn reset_clears_silence_start() {
        let mut det = SilenceDetector::new(0.1, 900);
        det.update(&silence(160), 0);
        det.reset();
        assert!(!det.is_silent_now());
        assert_eq!(det.silence_start_abs_ms(), None);
    }
}
