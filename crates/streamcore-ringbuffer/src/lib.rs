//! Fixed-capacity circular store of the most recent PCM audio, with an
//! absolute, never-reset sample counter so any in-buffer position maps back
//! to a session timestamp.
//!
//! Unlike a trim-on-demand growing buffer, this buffer never grows past
//! `capacity` and never fails on overflow: writes past capacity simply
//! overwrite the oldest samples in place.

use streamcore_types::Window;

/// A fixed-capacity circular PCM store.
pub struct RingBuffer {
    storage: Vec<f32>,
    capacity: usize,
    sample_rate: u32,
    write_head: usize,
    total_samples_written: u64,
}

impl RingBuffer {
    /// `capacity` is in samples, typically `windowMs * sampleRate / 1000`.
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be positive");
        Self {
            storage: vec![0.0; capacity],
            capacity,
            sample_rate,
            write_head: 0,
            total_samples_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Absolute count of samples ever appended; never resets except via
    /// [`RingBuffer::reset`].
    pub fn total_samples_written(&self) -> u64 {
        self.total_samples_written
    }

    /// Number of samples currently held (`min(total_samples_written,
    /// capacity)`).
    pub fn len(&self) -> usize {
        (self.total_samples_written.min(self.capacity as u64)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `samples` into storage at the write head, wrapping around and
    /// overwriting the oldest data as needed. There is no failure mode for
    /// overflow; a batch larger than `capacity` simply leaves only its own
    /// tail behind.
    pub fn append(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        for &sample in samples {
            self.storage[self.write_head] = sample;
            self.write_head = (self.write_head + 1) % self.capacity;
        }
        self.total_samples_written += samples.len() as u64;
        tracing::trace!(
            appended = samples.len(),
            total_samples_written = self.total_samples_written,
            "ring_buffer_append"
        );
    }

    /// Returns the in-order contents of the buffer (oldest to newest),
    /// tagged with absolute session timestamps. Returns an empty window
    /// with both timestamps 0 if nothing has been written yet.
    pub fn window(&self) -> Window {
        let available = self.len();
        if available == 0 {
            return Window::empty();
        }
        let start_index = (self.write_head + self.capacity - available) % self.capacity;
        let mut pcm = Vec::with_capacity(available);
        let mut idx = start_index;
        for _ in 0..available {
            pcm.push(self.storage[idx]);
            idx = (idx + 1) % self.capacity;
        }
        let window_end_abs_ms = ms_from_samples(self.total_samples_written, self.sample_rate);
        let window_start_abs_ms = ms_from_samples(
            self.total_samples_written - available as u64,
            self.sample_rate,
        );
        Window {
            pcm,
            window_start_abs_ms,
            window_end_abs_ms,
        }
    }

    /// Zeros storage, write head, and the total counter, returning the
    /// buffer to its just-constructed state.
    pub fn reset(&mut self) {
        self.storage.iter_mut().for_each(|s| *s = 0.0);
        self.write_head = 0;
        self.total_samples_written = 0;
    }
}

fn ms_from_samples(samples: u64, sample_rate: u32) -> i64 {
    (samples * 1_000 / sample_rate as u64) as i64
}
