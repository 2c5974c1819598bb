//! Core library for live audio features.
//!
//! Captures a microphone through a [`Platform`], turns the signal into a
//! small set of normalised perceptual features ([`AudioFeatures`]) and
//! publishes them to renderers. The [`CaptureController`] owns the lifecycle
//! and chooses between a block-synchronous processor running on the device
//! thread and a frame-paced fallback that polls a spectrum-analysis node.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod platform;

pub use analysis::{
    clamp01, compute_rms, onset_strength, spectral_centroid, AudioFeatures, FeatureExtractor,
    RawFeatures, Smoother, SmoothingMode, SmoothingState, Spectrum, Window, ONSET_GAIN,
};
pub use audio::{CaptureController, CaptureSnapshot, FeatureHandle, PathKind, Status};
pub use config::{AnalyserConfig, AppConfig, CaptureConfig, CaptureConstraints, MAX_FRAME_RATE};
pub use error::{CaptureError, PlatformError, Result, VizError};
pub use pipeline::{
    AnalyserNode, BlockSink, CaptureTrack, ContextState, DeviceStream, FeatureProcessor,
    PipelineContext, SampleRing, SampleTap, SourceNode, WorkletNode, WorkletOptions,
    FEATURE_PROCESSOR,
};
pub use platform::{list_input_devices, CpalPlatform, InputDeviceInfo, Platform};
