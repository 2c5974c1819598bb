use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SmoothingMode, VizError};

/// Upper bound on the fallback tick rate.
pub const MAX_FRAME_RATE: f32 = 1000.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.capture.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(?path, "loading configuration");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Configuration of the capture pipeline and both feature paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Substring of the capture device name; `None` selects the default input.
    pub device: Option<String>,
    /// Analysis window of the fallback path. Must be a power of two.
    pub fft_size: usize,
    /// Tick rate of the fallback path, in ticks per second.
    pub frame_rate: f32,
    /// Exponential smoothing coefficient shared by both paths.
    pub smoothing: f32,
    /// Input gain applied by the block processor.
    pub gain: f32,
    /// Scale applied to the rising RMS difference before clamping.
    pub onset_gain: f32,
    pub smoothing_mode: SmoothingMode,
    /// Try the block-synchronous path before falling back to polling.
    pub block_processing: bool,
    pub analyser: AnalyserConfig,
    pub constraints: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            fft_size: 2048,
            frame_rate: 60.0,
            smoothing: 0.85,
            gain: 1.0,
            onset_gain: 8.0,
            smoothing_mode: SmoothingMode::PerTick,
            block_processing: true,
            analyser: AnalyserConfig::default(),
            constraints: CaptureConstraints::default(),
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(VizError::Config(format!(
                "fft_size must be a power of two >= 32, got {}",
                self.fft_size
            )));
        }
        if !(self.frame_rate > 0.0 && self.frame_rate <= MAX_FRAME_RATE) {
            return Err(VizError::Config(format!(
                "frame_rate must be in (0, {MAX_FRAME_RATE}], got {}",
                self.frame_rate
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(VizError::Config(format!(
                "smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }
        let gain_ok = |gain: f32| gain.is_finite() && gain >= 0.0;
        if !gain_ok(self.gain) || !gain_ok(self.onset_gain) {
            return Err(VizError::Config("gains must be non-negative".to_string()));
        }
        if let SmoothingMode::TimeConstant { reference_rate } = self.smoothing_mode {
            if !(reference_rate.is_finite() && reference_rate > 0.0) {
                return Err(VizError::Config(
                    "time-constant smoothing needs a positive reference_rate".to_string(),
                ));
            }
        }
        self.analyser.validate()
    }
}

/// Parameters of the spectrum-analysis node used by the fallback path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    pub smoothing_time_constant: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            smoothing_time_constant: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl AnalyserConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(VizError::Config(
                "analyser smoothing_time_constant must be in [0, 1]".to_string(),
            ));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(VizError::Config(
                "analyser min_decibels must be below max_decibels".to_string(),
            ));
        }
        Ok(())
    }
}

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub video: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            video: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_presets() {
        let config = AppConfig::live_defaults();
        assert_eq!(config.capture.fft_size, 2048);
        assert_eq!(config.capture.smoothing, 0.85);
        assert_eq!(config.capture.gain, 1.0);
        assert_eq!(config.capture.onset_gain, 8.0);
        assert!(config.capture.block_processing);
        assert!(!config.capture.constraints.video);
        assert!(config.capture.constraints.echo_cancellation);
        assert!(config.capture.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "capture": { "fft_size": 1024, "device": "USB" } }"#)
                .unwrap();
        assert_eq!(config.capture.fft_size, 1024);
        assert_eq!(config.capture.device.as_deref(), Some("USB"));
        assert_eq!(config.capture.frame_rate, 60.0);
        assert_eq!(config.capture.analyser.max_decibels, -30.0);
    }

    #[test]
    fn rejects_non_power_of_two_window() {
        let err = AppConfig::from_json_str(r#"{ "capture": { "fft_size": 1000 } }"#).unwrap_err();
        assert!(matches!(err, VizError::Config(msg) if msg.contains("fft_size")));
    }

    #[test]
    fn rejects_unit_smoothing() {
        let config = CaptureConfig {
            smoothing: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_frame_rates() {
        for frame_rate in [0.0, -1.0, 1e10, f32::INFINITY, f32::NAN] {
            let config = CaptureConfig {
                frame_rate,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted {frame_rate}");
        }

        let err = AppConfig::from_json_str(r#"{ "capture": { "frame_rate": 1e10 } }"#).unwrap_err();
        assert!(matches!(err, VizError::Config(msg) if msg.contains("frame_rate")));

        let fastest = CaptureConfig {
            frame_rate: MAX_FRAME_RATE,
            ..Default::default()
        };
        assert!(fastest.validate().is_ok());
    }

    #[test]
    fn parses_time_constant_mode() {
        let config = AppConfig::from_json_str(
            r#"{ "capture": { "smoothing_mode": { "time_constant": { "reference_rate": 60.0 } } } }"#,
        )
        .unwrap();
        assert_eq!(
            config.capture.smoothing_mode,
            SmoothingMode::TimeConstant {
                reference_rate: 60.0
            }
        );
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            AppConfig::from_json_str("{ not json"),
            Err(VizError::Json(_))
        ));
    }
}
