//! Perceptual features computed from raw audio buffers.

mod smoothing;
mod spectrum;

use serde::{Deserialize, Serialize};

use crate::CaptureConfig;

pub use smoothing::{Smoother, SmoothingMode, SmoothingState};
pub use spectrum::{Spectrum, Window};

/// Default scale applied to the rising RMS difference.
pub const ONSET_GAIN: f32 = 8.0;

const CENTROID_EPSILON: f64 = 1e-9;

/// Feature vector published once per tick by the active feature path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    /// Smoothed loudness, `>= 0`.
    pub rms: f32,
    /// Smoothed spectral brightness in `[0, 1]`.
    pub centroid: f32,
    /// Smoothed transient strength in `[0, 1]`.
    pub onset: f32,
    /// Pipeline clock in seconds.
    pub t: f64,
}

impl AudioFeatures {
    pub const ZERO: Self = Self {
        rms: 0.0,
        centroid: 0.0,
        onset: 0.0,
        t: 0.0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Unsmoothed features for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawFeatures {
    pub rms: f32,
    pub centroid: f32,
    pub onset: f32,
}

/// Clamps to `[0, 1]`, mapping NaN to zero.
pub fn clamp01(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Root-mean-square amplitude; zero for an empty buffer.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Magnitude-weighted mean bin index divided by the bin count.
///
/// Returns zero when the spectrum carries no energy.
pub fn spectral_centroid(magnitudes: &[f32]) -> f32 {
    let mut magnitude_sum = 0.0_f64;
    let mut weighted_sum = 0.0_f64;
    for (i, magnitude) in magnitudes.iter().enumerate() {
        let magnitude = *magnitude as f64;
        magnitude_sum += magnitude;
        weighted_sum += i as f64 * magnitude;
    }

    if magnitude_sum > CENTROID_EPSILON {
        clamp01((weighted_sum / magnitude_sum / magnitudes.len() as f64) as f32)
    } else {
        0.0
    }
}

/// First-difference transient detector: only rising energy counts.
pub fn onset_strength(rms: f32, prev_rms: f32, gain: f32) -> f32 {
    clamp01((rms - prev_rms).max(0.0) * gain)
}

/// Feature algorithms plus the smoothing state of one feature path instance.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    smoothing: SmoothingState,
    prev_rms: f32,
    onset_gain: f32,
}

impl FeatureExtractor {
    pub fn new(coefficient: f32, mode: SmoothingMode, onset_gain: f32) -> Self {
        Self {
            smoothing: SmoothingState::new(coefficient, mode),
            prev_rms: 0.0,
            onset_gain,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.smoothing, config.smoothing_mode, config.onset_gain)
    }

    pub fn reset(&mut self) {
        self.smoothing.reset();
        self.prev_rms = 0.0;
    }

    pub fn prev_rms(&self) -> f32 {
        self.prev_rms
    }

    /// Computes the raw features of one tick and advances the onset
    /// detector's previous RMS.
    pub fn measure(&mut self, time_domain: &[f32], magnitudes: &[f32]) -> RawFeatures {
        self.measure_scaled(time_domain, magnitudes, 1.0)
    }

    pub(crate) fn measure_scaled(
        &mut self,
        time_domain: &[f32],
        magnitudes: &[f32],
        gain: f32,
    ) -> RawFeatures {
        let rms = compute_rms(time_domain) * gain;
        let onset = onset_strength(rms, self.prev_rms, self.onset_gain);
        self.prev_rms = rms;

        RawFeatures {
            rms,
            centroid: spectral_centroid(magnitudes),
            onset,
        }
    }

    /// Measures, smooths and stamps one tick. `dt` is the time since the
    /// previous tick in seconds.
    pub fn process(
        &mut self,
        time_domain: &[f32],
        magnitudes: &[f32],
        t: f64,
        dt: f32,
    ) -> AudioFeatures {
        let raw = self.measure(time_domain, magnitudes);
        self.smooth(raw, t, dt)
    }

    pub(crate) fn smooth(&mut self, raw: RawFeatures, t: f64, dt: f32) -> AudioFeatures {
        let smoothed = self.smoothing.apply(raw, dt);
        AudioFeatures {
            rms: smoothed.rms.max(0.0),
            centroid: clamp01(smoothed.centroid),
            onset: clamp01(smoothed.onset),
            t: t.max(0.0),
        }
    }
}
