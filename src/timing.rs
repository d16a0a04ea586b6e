//! Word start-time estimates for read-aloud highlighting.
//!
//! The speech engines give no per-word events, so highlight timing is guessed
//! from word length. The estimate only drives the UI and can drift from the
//! actual audio.

use std::time::Duration;

/// Per-word duration constants, in milliseconds at rate 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordTimingPolicy {
    pub short_max_len: usize,
    pub short_ms: f64,
    pub medium_max_len: usize,
    pub medium_ms: f64,
    pub long_base_ms: f64,
    pub long_per_char_ms: f64,
}

impl Default for WordTimingPolicy {
    fn default() -> Self {
        Self {
            short_max_len: 3,
            short_ms: 250.0,
            medium_max_len: 6,
            medium_ms: 350.0,
            long_base_ms: 400.0,
            long_per_char_ms: 30.0,
        }
    }
}

impl WordTimingPolicy {
    /// Unscaled duration of a word of `len` characters.
    pub fn base_ms(&self, len: usize) -> f64 {
        if len <= self.short_max_len {
            self.short_ms
        } else if len <= self.medium_max_len {
            self.medium_ms
        } else {
            let extra = len - (self.medium_max_len + 1);
            self.long_base_ms + self.long_per_char_ms * extra as f64
        }
    }

    pub fn word_ms(&self, len: usize, rate: f32) -> f64 {
        self.base_ms(len) / f64::from(rate)
    }

    /// Cumulative start time of every word: `T[0] = 0`, each later entry adds
    /// the scaled duration of the word before it.
    pub fn cumulative_ms<S: AsRef<str>>(&self, words: &[S], rate: f32) -> Vec<f64> {
        let mut timings = Vec::with_capacity(words.len());
        if words.is_empty() {
            return timings;
        }
        let mut current = 0.0;
        timings.push(current);
        for word in &words[..words.len() - 1] {
            current += self.word_ms(word.as_ref().chars().count(), rate);
            timings.push(current);
        }
        timings
    }
}

/// Precomputed start times for one reading session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingTable {
    starts_ms: Vec<f64>,
}

impl TimingTable {
    pub fn build<S: AsRef<str>>(policy: &WordTimingPolicy, words: &[S], rate: f32) -> Self {
        Self {
            starts_ms: policy.cumulative_ms(words, rate),
        }
    }

    /// Wait between highlighting word `index` and word `index + 1`.
    pub fn delay_after(&self, index: usize) -> Option<Duration> {
        let current = self.starts_ms.get(index)?;
        let next = self.starts_ms.get(index + 1)?;
        Some(Duration::from_secs_f64((next - current).max(0.0) / 1000.0))
    }
}
