use serde::{Deserialize, Serialize};

use super::RawFeatures;

/// How the smoothing coefficient relates to the time between updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingMode {
    /// The coefficient is applied once per update regardless of elapsed time,
    /// so the effective time constant follows the tick rate. Existing presets
    /// are tuned against this behaviour.
    #[default]
    PerTick,
    /// The coefficient describes one update at `reference_rate` updates per
    /// second and is rescaled to the measured elapsed time, giving the true
    /// time constant `exp(-dt / tau)`.
    TimeConstant { reference_rate: f32 },
}

/// Single-pole exponential filter: `y <- a * y + (1 - a) * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoother {
    coefficient: f32,
    mode: SmoothingMode,
    value: f32,
}

impl Smoother {
    pub fn new(coefficient: f32, mode: SmoothingMode) -> Self {
        Self {
            coefficient: coefficient.clamp(0.0, 1.0),
            mode,
            value: 0.0,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }

    /// Folds `raw` into the filter. `dt` is the time since the previous
    /// update in seconds and is ignored in [`SmoothingMode::PerTick`].
    pub fn update(&mut self, raw: f32, dt: f32) -> f32 {
        let a = self.coefficient_for(dt);
        self.value = a * self.value + (1.0 - a) * raw;
        self.value
    }

    /// Effective coefficient for an update `dt` seconds after the last one.
    pub fn coefficient_for(&self, dt: f32) -> f32 {
        match self.mode {
            SmoothingMode::PerTick => self.coefficient,
            SmoothingMode::TimeConstant { reference_rate } => {
                if !dt.is_finite() || dt < 0.0 || !(reference_rate > 0.0) {
                    return self.coefficient;
                }
                // a^(dt * rate) == exp(-dt / tau) with tau = -1 / (rate * ln a)
                self.coefficient.powf(dt * reference_rate)
            }
        }
    }
}

/// Smoothed copies of the three raw features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingState {
    pub rms: Smoother,
    pub centroid: Smoother,
    pub onset: Smoother,
}

impl SmoothingState {
    pub fn new(coefficient: f32, mode: SmoothingMode) -> Self {
        let smoother = Smoother::new(coefficient, mode);
        Self {
            rms: smoother,
            centroid: smoother,
            onset: smoother,
        }
    }

    pub fn reset(&mut self) {
        self.rms.reset();
        self.centroid.reset();
        self.onset.reset();
    }

    pub fn apply(&mut self, raw: RawFeatures, dt: f32) -> RawFeatures {
        RawFeatures {
            rms: self.rms.update(raw.rms, dt),
            centroid: self.centroid.update(raw.centroid, dt),
            onset: self.onset.update(raw.onset, dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_tick_uses_fixed_coefficient() {
        let mut smoother = Smoother::new(0.85, SmoothingMode::PerTick);
        let first = smoother.update(1.0, 0.001);
        assert!((first - 0.15).abs() < 1e-6);
        let second = smoother.update(1.0, 10.0);
        assert!((second - (0.85 * 0.15 + 0.15)).abs() < 1e-6);
    }

    #[test]
    fn time_constant_matches_per_tick_at_reference_rate() {
        let smoother = Smoother::new(
            0.85,
            SmoothingMode::TimeConstant {
                reference_rate: 60.0,
            },
        );
        assert!((smoother.coefficient_for(1.0 / 60.0) - 0.85).abs() < 1e-5);
        // Two ticks at 120 Hz decay as much as one tick at 60 Hz.
        let half = smoother.coefficient_for(1.0 / 120.0);
        assert!((half * half - 0.85).abs() < 1e-5);
    }

    #[test]
    fn zero_elapsed_time_holds_value() {
        let mut smoother = Smoother::new(
            0.85,
            SmoothingMode::TimeConstant {
                reference_rate: 60.0,
            },
        );
        smoother.update(1.0, 1.0 / 60.0);
        let held = smoother.value();
        assert_eq!(smoother.update(0.0, 0.0), held);
    }

    #[test]
    fn state_smooths_each_feature_independently() {
        let mut state = SmoothingState::new(0.5, SmoothingMode::PerTick);
        let out = state.apply(
            RawFeatures {
                rms: 1.0,
                centroid: 0.5,
                onset: 0.0,
            },
            0.0,
        );
        assert_eq!(out.rms, 0.5);
        assert_eq!(out.centroid, 0.25);
        assert_eq!(out.onset, 0.0);

        state.reset();
        assert_eq!(state.rms.value(), 0.0);
    }
}
