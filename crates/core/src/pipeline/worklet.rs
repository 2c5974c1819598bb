use std::fmt;

use tokio::sync::mpsc;

use super::{BlockSink, PipelineContext};
use crate::{
    AudioFeatures, FeatureExtractor, PlatformError, SmoothingMode, Spectrum, Window, ONSET_GAIN,
};

/// Name under which the block-synchronous feature processor is registered.
pub const FEATURE_PROCESSOR: &str = "feature-processor";

const PORT_CAPACITY: usize = 64;

/// Parameters fixed when the node is constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkletOptions {
    pub smoothing: f32,
    pub smoothing_mode: SmoothingMode,
    pub gain: f32,
    pub onset_gain: f32,
}

impl Default for WorkletOptions {
    fn default() -> Self {
        Self {
            smoothing: 0.85,
            smoothing_mode: SmoothingMode::PerTick,
            gain: 1.0,
            onset_gain: ONSET_GAIN,
        }
    }
}

/// Per-block feature extraction that runs on the device callback thread.
///
/// Posts one [`AudioFeatures`] per block. Posting never blocks: while the
/// port is full further messages are dropped, and the host only ever
/// publishes the newest message it has received.
pub struct FeatureProcessor {
    context: PipelineContext,
    extractor: FeatureExtractor,
    spectrum: Spectrum,
    magnitudes: Vec<f32>,
    gain: f32,
    port: mpsc::Sender<AudioFeatures>,
}

impl FeatureProcessor {
    fn new(
        context: PipelineContext,
        options: WorkletOptions,
        port: mpsc::Sender<AudioFeatures>,
    ) -> Self {
        Self {
            context,
            extractor: FeatureExtractor::new(
                options.smoothing,
                options.smoothing_mode,
                options.onset_gain,
            ),
            spectrum: Spectrum::new(Window::Hann),
            magnitudes: Vec::new(),
            gain: options.gain.max(0.0),
            port,
        }
    }

    /// Computes the features of one block.
    pub fn process(&mut self, block: &[f32]) -> AudioFeatures {
        if self.spectrum.magnitudes(block, &mut self.magnitudes).is_err() {
            self.magnitudes.clear();
        }
        let raw = self
            .extractor
            .measure_scaled(block, &self.magnitudes, self.gain);
        let dt = block.len() as f32 / self.context.sample_rate() as f32;
        self.extractor.smooth(raw, self.context.current_time(), dt)
    }

    fn process_and_post(&mut self, block: &[f32]) {
        let features = self.process(block);
        // Full or closed ports drop the message.
        let _ = self.port.try_send(features);
    }

    fn into_sink(mut self) -> BlockSink {
        Box::new(move |block| self.process_and_post(block))
    }
}

impl fmt::Debug for FeatureProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureProcessor")
            .field("gain", &self.gain)
            .field("spectrum", &self.spectrum)
            .finish()
    }
}

/// Host-side handle of the block-synchronous path: the processor to install
/// on the source and the port its messages arrive on.
pub struct WorkletNode {
    options: WorkletOptions,
    processor: FeatureProcessor,
    port: mpsc::Receiver<AudioFeatures>,
}

impl WorkletNode {
    /// Fails when `name` was never registered on `context`.
    pub fn new(
        context: &PipelineContext,
        name: &str,
        options: WorkletOptions,
    ) -> Result<Self, PlatformError> {
        if !context.has_module(name) {
            return Err(PlatformError::NodeUnavailable(name.to_string()));
        }

        let (tx, port) = mpsc::channel(PORT_CAPACITY);
        Ok(Self {
            options,
            processor: FeatureProcessor::new(context.clone(), options, tx),
            port,
        })
    }

    pub fn options(&self) -> WorkletOptions {
        self.options
    }

    /// Splits the node into the sink for the source node and the receiving
    /// end of its message port.
    pub fn into_parts(self) -> (BlockSink, mpsc::Receiver<AudioFeatures>) {
        (self.processor.into_sink(), self.port)
    }
}

impl fmt::Debug for WorkletNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletNode")
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn running_context() -> PipelineContext {
        let context = PipelineContext::new(48_000);
        context.resume().unwrap();
        context.register_module(FEATURE_PROCESSOR).unwrap();
        context
    }

    #[test]
    fn construction_requires_registered_module() {
        let context = PipelineContext::new(48_000);
        let err = WorkletNode::new(&context, FEATURE_PROCESSOR, WorkletOptions::default())
            .unwrap_err();
        assert_eq!(err, PlatformError::NodeUnavailable(FEATURE_PROCESSOR.to_string()));
    }

    #[test]
    fn posts_one_message_per_block() {
        let context = running_context();
        let node = WorkletNode::new(&context, FEATURE_PROCESSOR, WorkletOptions::default()).unwrap();
        let (mut sink, mut port) = node.into_parts();

        let block: Vec<f32> = (0..128)
            .map(|i| (2.0 * PI * 4.0 * i as f32 / 128.0).sin())
            .collect();
        for _ in 0..3 {
            context.advance(block.len());
            sink(&block);
        }

        let mut received = Vec::new();
        while let Ok(features) = port.try_recv() {
            received.push(features);
        }
        assert_eq!(received.len(), 3);
        for features in &received {
            assert!(features.rms >= 0.0);
            assert!((0.0..=1.0).contains(&features.centroid));
            assert!((0.0..=1.0).contains(&features.onset));
        }
        assert!(received[2].rms > received[0].rms);
        assert!(received[2].t > received[0].t);
    }

    #[test]
    fn gain_scales_rms() {
        let context = running_context();
        let options = WorkletOptions {
            smoothing: 0.0,
            gain: 2.0,
            ..Default::default()
        };
        let node = WorkletNode::new(&context, FEATURE_PROCESSOR, options).unwrap();
        let (mut sink, mut port) = node.into_parts();

        sink(&[0.25; 64]);
        let features = port.try_recv().unwrap();
        assert!((features.rms - 0.5).abs() < 1e-6);
        assert_eq!(features.onset, 1.0);
    }

    #[test]
    fn onset_gain_comes_from_options() {
        let context = running_context();
        let options = WorkletOptions {
            smoothing: 0.0,
            onset_gain: 2.0,
            ..Default::default()
        };
        let node = WorkletNode::new(&context, FEATURE_PROCESSOR, options).unwrap();
        let (mut sink, mut port) = node.into_parts();

        sink(&[0.25; 64]);
        let features = port.try_recv().unwrap();
        assert!((features.onset - 0.5).abs() < 1e-6);
    }

    #[test]
    fn time_constant_smoothing_uses_block_duration() {
        let context = running_context();
        // 256 frames at 48 kHz span two updates at 375 Hz.
        let options = WorkletOptions {
            smoothing: 0.5,
            smoothing_mode: SmoothingMode::TimeConstant {
                reference_rate: 375.0,
            },
            ..Default::default()
        };
        let node = WorkletNode::new(&context, FEATURE_PROCESSOR, options).unwrap();
        let (mut sink, mut port) = node.into_parts();

        sink(&[0.4; 256]);
        let features = port.try_recv().unwrap();
        assert!((features.rms - 0.75 * 0.4).abs() < 1e-5);
    }

    #[test]
    fn full_port_drops_messages_without_blocking() {
        let context = running_context();
        let node = WorkletNode::new(&context, FEATURE_PROCESSOR, WorkletOptions::default()).unwrap();
        let (mut sink, mut port) = node.into_parts();

        for _ in 0..(PORT_CAPACITY * 2) {
            sink(&[0.1; 32]);
        }

        let mut count = 0;
        while port.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, PORT_CAPACITY);
    }
}
