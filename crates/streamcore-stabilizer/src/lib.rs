//! Converts a sequence of overlapping decode results into a monotonic
//! committed/speculative transcript.
//!
//! `committedWords` only ever grows (subject to the regression guard);
//! `speculativeWords` is replaced wholesale on every update. This is the
//! largest and most detail-sensitive component of the pipeline: ordering,
//! de-duplication at window boundaries, and the confidence floor all live
//! here.

use streamcore_types::{DecodeResult, Segment};

/// One word, timed and scored, produced by flattening a decode result.
#[derive(Debug, Clone, PartialEq)]
struct StabilizerWord {
    text: String,
    abs_end_ms: i64,
    min_prob: f32,
}

/// Tracks the committed/speculative partition for one recording session.
pub struct TranscriptStabilizer {
    committed_words: Vec<StabilizerWord>,
    speculative_words: Vec<StabilizerWord>,
    commit_cursor_abs_ms: i64,
}

impl TranscriptStabilizer {
    pub fn new() -> Self {
        Self {
            committed_words: Vec::new(),
            speculative_words: Vec::new(),
            commit_cursor_abs_ms: 0,
        }
    }

    pub fn commit_cursor_abs_ms(&self) -> i64 {
        self.commit_cursor_abs_ms
    }

    pub fn committed_word_count(&self) -> usize {
        self.committed_words.len()
    }

    pub fn speculative_word_count(&self) -> usize {
        self.speculative_words.len()
    }

    pub fn committed_text(&self) -> String {
        join_words(&self.committed_words)
    }

    pub fn speculative_text(&self) -> String {
        join_words(&self.speculative_words)
    }

    /// `committed + " " + speculative` (no separating space if either is
    /// empty).
    pub fn display_text(&self) -> String {
        let committed = self.committed_text();
        let speculative = self.speculative_text();
        match (committed.is_empty(), speculative.is_empty()) {
            (true, true) => String::new(),
            (true, false) => speculative,
            (false, true) => committed,
            (false, false) => format!("{committed} {speculative}"),
        }
    }

    /// Applies one decode result, advancing the committed/speculative
    /// partition. `window_end_abs_ms`, `commit_margin_ms`, and
    /// `min_token_probability` come from the session's `PipelineConfig`.
    #[tracing::instrument(
        level = "trace",
        skip(self, result),
        fields(
            segments = result.segments.len(),
            commit_cursor_abs_ms = self.commit_cursor_abs_ms,
        )
    )]
    pub fn update(
        &mut self,
        result: &DecodeResult,
        window_end_abs_ms: i64,
        commit_margin_ms: u32,
        min_token_probability: f32,
    ) {
        // Flatten every segment into words in time order.
        let words: Vec<StabilizerWord> = result
            .segments
            .iter()
            .flat_map(|segment| words_from_segment(segment, result.window_start_abs_ms))
            .collect();

        // This decode's full reproduction of the window, and the slice of
        // already-committed words that same window should agree with — used
        // by the regression guard below, which reasons about the window's
        // overlap with already-committed audio rather than the whole session.
        let window_reproduction_chars = char_len(&words);
        let committed_chars_in_window = char_len(
            &self
                .committed_words
                .iter()
                .filter(|w| w.abs_end_ms >= result.window_start_abs_ms)
                .cloned()
                .collect::<Vec<_>>(),
        );

        // Drop anything already committed in a prior update.
        let pending: Vec<StabilizerWord> = words
            .into_iter()
            .filter(|w| w.abs_end_ms > self.commit_cursor_abs_ms)
            .collect();

        // Partition the rest at the commit horizon.
        let horizon = window_end_abs_ms - commit_margin_ms as i64;
        let mut commit_candidates = Vec::new();
        let mut new_speculative = Vec::new();
        for w in pending {
            if w.abs_end_ms <= horizon {
                commit_candidates.push(w);
            } else {
                new_speculative.push(w);
            }
        }

        // A commit prefix must be a contiguous confident run: stop at the
        // first low-probability word rather than cherry-picking around it.
        let mut confident_candidates = Vec::with_capacity(commit_candidates.len());
        for w in commit_candidates {
            if w.min_prob < min_token_probability {
                break;
            }
            confident_candidates.push(w);
        }

        // Drop the echoed prefix that duplicates the committed tail.
        let deduped = dedup_join(&self.committed_words, confident_candidates);

        // Regression guard: this decode's own reproduction of the window
        // must not be a strictly worse (shorter) transcription of audio this
        // stabilizer has already committed for that window. A disconnected,
        // suspiciously short re-decode of already-committed audio is
        // discarded for this tick only; speculative still replaces.
        if window_reproduction_chars > 0
            && committed_chars_in_window > 0
            && window_reproduction_chars < committed_chars_in_window
        {
            tracing::warn!(
                window_reproduction_chars,
                committed_chars_in_window,
                "stabilizer_would_shrink_commit_discarded"
            );
        } else if !deduped.is_empty() {
            let new_cursor = deduped
                .iter()
                .map(|w| w.abs_end_ms)
                .fold(self.commit_cursor_abs_ms, i64::max);
            self.committed_words.extend(deduped);
            self.commit_cursor_abs_ms = self.commit_cursor_abs_ms.max(new_cursor);
            tracing::debug!(
                commit_cursor_abs_ms = self.commit_cursor_abs_ms,
                committed_word_count = self.committed_words.len(),
                "stabilizer_commit"
            );
        }

        self.speculative_words = new_speculative;
    }

    /// Appends all current speculative words to committed unconditionally
    /// and clears speculative. Called exactly once, when recording stops.
    pub fn finalize_all(&mut self) {
        if self.speculative_words.is_empty() {
            return;
        }
        if let Some(last) = self.speculative_words.last() {
            self.commit_cursor_abs_ms = self.commit_cursor_abs_ms.max(last.abs_end_ms);
        }
        self.committed_words.append(&mut self.speculative_words);
        tracing::info!(
            committed_word_count = self.committed_words.len(),
            "stabilizer_finalized"
        );
    }

    pub fn reset(&mut self) {
        self.committed_words.clear();
        self.speculative_words.clear();
        self.commit_cursor_abs_ms = 0;
    }
}

impl Default for TranscriptStabilizer {
    fn default() -> Self {
        Self::new()
    }
}

fn join_words(words: &[StabilizerWord]) -> String {
    words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn char_len(words: &[StabilizerWord]) -> usize {
    join_words(words).chars().count()
}

/// Splits a segment's text into whitespace-delimited words and assigns each
/// an absolute end time and a confidence.
///
/// When the segment carries token-level timing, tokens are walked as a
/// character budget against each word so sub-word tokens map onto the
/// whitespace-delimited words they compose; each word's confidence is the
/// minimum probability of the tokens that compose it. When the segment has
/// no tokens, every word shares the segment's own end time, and is treated
/// as a single confident unit (probability 1.0) since there is no
/// finer-grained signal to gate on.
fn words_from_segment(segment: &Segment, window_start_abs_ms: i64) -> Vec<StabilizerWord> {
    let raw_words: Vec<&str> = segment.text.split_whitespace().collect();
    if segment.tokens.is_empty() {
        let abs_end_ms = window_start_abs_ms + segment.end_ms as i64;
        return raw_words
            .into_iter()
            .map(|text| StabilizerWord {
                text: text.to_string(),
                abs_end_ms,
                min_prob: 1.0,
            })
            .collect();
    }

    let mut out = Vec::with_capacity(raw_words.len());
    let mut token_idx = 0usize;
    let mut consumed_in_token = 0usize;

    for raw_word in raw_words {
        let mut remaining = raw_word.chars().count().max(1);
        let mut min_prob = f32::MAX;
        let mut end_ms = segment.end_ms;

        while remaining > 0 && token_idx < segment.tokens.len() {
            let token = &segment.tokens[token_idx];
            let token_len = token.text.chars().count().max(1);
            let available = token_len.saturating_sub(consumed_in_token);
            let take = available.min(remaining);
            remaining -= take;
            consumed_in_token += take;
            min_prob = min_prob.min(token.probability);
            end_ms = token.end_time_ms;
            if consumed_in_token >= token_len {
                token_idx += 1;
                consumed_in_token = 0;
            }
        }

        if min_prob == f32::MAX {
            min_prob = 1.0;
        }
        out.push(StabilizerWord {
            text: raw_word.to_string(),
            abs_end_ms: window_start_abs_ms + end_ms as i64,
            min_prob,
        });
    }
    out
}

const MAX_DEDUP_OVERLAP: usize = 4;

/// Drops the prefix of `candidates` that echoes the tail of `committed`,
/// trying the largest overlap (K = 4 down to 1) first.
fn dedup_join(
    committed: &[StabilizerWord],
    candidates: Vec<StabilizerWord>,
) -> Vec<StabilizerWord> {
    if committed.is_empty() || candidates.is_empty() {
        return candidates;
    }
    for k in (1..=MAX_DEDUP_OVERLAP).rev() {
        if k > committed.len() || k > candidates.len() {
            continue;
        }
        let committed_tail = &committed[committed.len() - k..];
        let candidate_head = &candidates[..k];
        let matches = committed_tail
            .iter()
            .zip(candidate_head.iter())
            .all(|(a, b)| normalize(&a.text) == normalize(&b.text));
        if matches {
            return candidates.into_iter().skip(k).collect();
        }
    }
    candidates
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamcore_types::{Segment, Token};

    fn segment_no_tokens(text: &str, end_ms: u32) -> Segment {
        Segment::new(text, 0, end_ms)
    }

    fn token(text: &str, end_ms: u32, prob: f32) -> Token {
        Token {
            text: text.to_string(),
            start_time_ms: 0,
            end_time_ms: end_ms,
            probability: prob,
        }
    }

    #[test]
    fn commits_words_before_horizon_and_keeps_rest_speculative() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![segment_no_tokens("hello world foo bar", 4000)],
            window_start_abs_ms: 0,
        };
        // horizon = window_end (8000) - margin (700) = 7300; all words share
        // end time 4000 so all are eligible.
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "hello world foo bar");
        assert_eq!(stab.speculative_text(), "");
    }

    #[test]
    fn words_past_horizon_stay_speculative() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![segment_no_tokens("hello world", 7900)],
            window_start_abs_ms: 0,
        };
        // horizon = 8000 - 700 = 7300; word end 7900 > horizon.
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "");
        assert_eq!(stab.speculative_text(), "hello world");
    }

    #[test]
    fn token_end_time_exactly_equal_to_horizon_is_committed() {
        let mut stab = TranscriptStabilizer::new();
        let seg = Segment::new("hi", 0, 7300).with_tokens(vec![token("hi", 7300, 0.9)]);
        let result = DecodeResult {
            segments: vec![seg],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "hi");
    }

    #[test]
    fn low_probability_word_blocks_itself_and_later_candidates() {
        let mut stab = TranscriptStabilizer::new();
        let seg = Segment::new("good bad good2", 0, 1000).with_tokens(vec![
            token("good", 100, 0.9),
            token("bad", 200, 0.1),
            token("good2", 300, 0.9),
        ]);
        let result = DecodeResult {
            segments: vec![seg],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "good");
        assert_eq!(stab.speculative_text(), "");
    }

    #[test]
    fn repeated_identical_update_is_idempotent() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![segment_no_tokens("the quick fox", 2000)],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        let committed_after_first = stab.committed_text();
        let speculative_after_first = stab.speculative_text();
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), committed_after_first);
        assert_eq!(stab.speculative_text(), speculative_after_first);
    }

    #[test]
    fn already_committed_words_are_not_recommitted_across_updates() {
        let mut stab = TranscriptStabilizer::new();
        let first = DecodeResult {
            segments: vec![segment_no_tokens("the quick fox", 2000)],
            window_start_abs_ms: 0,
        };
        stab.update(&first, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "the quick fox");

        // Sliding window re-decodes with overlap ("quick fox") plus new text.
        let second = DecodeResult {
            segments: vec![segment_no_tokens("quick fox jumps", 3000)],
            window_start_abs_ms: 0,
        };
        stab.update(&second, 9000, 700, 0.30);
        assert_eq!(stab.committed_text(), "the quick fox jumps");
    }

    #[test]
    fn dedup_join_drops_echoed_prefix() {
        let mut stab = TranscriptStabilizer::new();
        let first = DecodeResult {
            segments: vec![segment_no_tokens("one two three", 500)],
            window_start_abs_ms: 0,
        };
        stab.update(&first, 8000, 700, 0.30);

        let second = DecodeResult {
            segments: vec![segment_no_tokens("two three four five", 1500)],
            window_start_abs_ms: 0,
        };
        stab.update(&second, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), "one two three four five");
    }

    #[test]
    fn regression_guard_discards_shrinking_candidate_but_keeps_speculative() {
        let mut stab = TranscriptStabilizer::new();
        let first = DecodeResult {
            segments: vec![segment_no_tokens("the quick brown fox jumps", 500)],
            window_start_abs_ms: 0,
        };
        stab.update(&first, 8000, 700, 0.30);
        let committed_before = stab.committed_text();

        // A later decode pass produces a much shorter candidate for the
        // next span (e.g. a hallucinated short fragment).
        let second = DecodeResult {
            segments: vec![segment_no_tokens("hi", 600)],
            window_start_abs_ms: 0,
        };
        stab.update(&second, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), committed_before);
        assert_eq!(stab.speculative_text(), "");
    }

    #[test]
    fn empty_segments_clear_speculative_and_leave_committed_untouched() {
        let mut stab = TranscriptStabilizer::new();
        let first = DecodeResult {
            segments: vec![segment_no_tokens("hello", 500)],
            window_start_abs_ms: 0,
        };
        stab.update(&first, 8000, 700, 0.30);
        let committed_before = stab.committed_text();

        let empty = DecodeResult::empty(0);
        stab.update(&empty, 8000, 700, 0.30);
        assert_eq!(stab.committed_text(), committed_before);
        assert_eq!(stab.speculative_text(), "");
    }

    #[test]
    fn finalize_all_commits_remaining_speculative_unconditionally() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![segment_no_tokens("hello world", 7900)],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.speculative_text(), "hello world");
        stab.finalize_all();
        assert_eq!(stab.committed_text(), "hello world");
        assert_eq!(stab.speculative_text(), "");
    }

    #[test]
    fn display_text_joins_committed_and_speculative_with_single_space() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![
                segment_no_tokens("hello", 500),
                segment_no_tokens("world", 7900),
            ],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        assert_eq!(stab.display_text(), "hello world");
    }

    #[test]
    fn reset_clears_all_state() {
        let mut stab = TranscriptStabilizer::new();
        let result = DecodeResult {
            segments: vec![segment_no_tokens("hello world", 500)],
            window_start_abs_ms: 0,
        };
        stab.update(&result, 8000, 700, 0.30);
        stab.reset();
        assert_eq!(stab.committed_text(), "");
        assert_eq!(stab.speculative_text(), "");
        assert_eq!(stab.commit_cursor_abs_ms(), 0);
    }
}
