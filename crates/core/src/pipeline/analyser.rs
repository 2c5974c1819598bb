use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use super::BlockSink;
use crate::{AnalyserConfig, Result, Spectrum, VizError, Window};

/// Circular buffer of the most recent mono samples.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: Vec<f32>,
    write_pos: usize,
    filled: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            write_pos: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn push_samples(&mut self, data: &[f32]) {
        let capacity = self.samples.len();
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % capacity;
        }
        self.filled = (self.filled + data.len()).min(capacity);
    }

    /// Fills `out` with the latest samples in time order. When fewer samples
    /// than `out.len()` have arrived the front is zero-padded.
    pub fn copy_latest(&self, out: &mut [f32]) {
        let capacity = self.samples.len();
        let count = out.len().min(self.filled);
        let pad = out.len() - count;
        out[..pad].fill(0.0);

        let start = (self.write_pos + capacity - count) % capacity;
        for (i, slot) in out[pad..].iter_mut().enumerate() {
            *slot = self.samples[(start + i) % capacity];
        }
    }
}

/// Spectrum-analysis node: keeps a window of recent input and answers
/// time-domain and frequency-magnitude queries on demand.
pub struct AnalyserNode {
    fft_size: usize,
    config: AnalyserConfig,
    ring: Arc<Mutex<SampleRing>>,
    spectrum: Spectrum,
    window: Vec<f32>,
    magnitudes: Vec<f32>,
    smoothed: Vec<f32>,
}

impl AnalyserNode {
    pub fn new(fft_size: usize, config: AnalyserConfig) -> Result<Self> {
        if fft_size < 2 || !fft_size.is_power_of_two() {
            return Err(VizError::InvalidInput(
                "analyser fft size must be a power of two",
            ));
        }

        Ok(Self {
            fft_size,
            config,
            ring: Arc::new(Mutex::new(SampleRing::new(fft_size))),
            spectrum: Spectrum::new(Window::Blackman),
            window: vec![0.0; fft_size],
            magnitudes: Vec::with_capacity(fft_size / 2),
            smoothed: vec![0.0; fft_size / 2],
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Sink to connect to a [`super::SourceNode`].
    pub fn input(&self) -> BlockSink {
        let ring = self.ring.clone();
        Box::new(move |block| ring.lock().push_samples(block))
    }

    /// Copies the latest `out.len()` input samples (at most `fft_size`).
    pub fn get_float_time_domain_data(&self, out: &mut [f32]) {
        let len = out.len().min(self.fft_size);
        self.ring.lock().copy_latest(&mut out[..len]);
    }

    /// Writes byte-quantised magnitudes normalised to `[0, 1]`, one per bin,
    /// for the latest `fft_size` samples.
    pub fn get_byte_frequency_data(&mut self, out: &mut [f32]) -> Result<()> {
        self.ring.lock().copy_latest(&mut self.window);
        self.spectrum.magnitudes(&self.window, &mut self.magnitudes)?;

        let tau = self.config.smoothing_time_constant;
        let min_db = self.config.min_decibels;
        let range = self.config.max_decibels - min_db;

        for (smoothed, magnitude) in self.smoothed.iter_mut().zip(&self.magnitudes) {
            let next = tau * *smoothed + (1.0 - tau) * magnitude;
            *smoothed = if next.is_finite() { next } else { 0.0 };
        }

        for (slot, smoothed) in out.iter_mut().zip(&self.smoothed) {
            let db = 20.0 * smoothed.log10();
            let byte = (255.0 / range * (db - min_db)).floor();
            *slot = if byte.is_finite() {
                byte.clamp(0.0, 255.0) / 255.0
            } else {
                0.0
            };
        }
        Ok(())
    }
}

impl fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("fft_size", &self.fft_size)
            .field("config", &self.config)
            .finish()
    }
}
