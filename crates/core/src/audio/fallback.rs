//! Frame-paced polling of a spectrum-analysis node.

use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use super::path::Publisher;
use crate::{
    AnalyserNode, AudioFeatures, CaptureConfig, CaptureError, FeatureExtractor, PipelineContext,
    SourceNode,
};

/// Shortest tick period the fallback loop will run at.
const MIN_FRAME_PERIOD: Duration = Duration::from_millis(1);

/// Fallback feature path. Owns a fresh smoothing state per instance.
pub(crate) struct FallbackPath {
    pending: Option<FallbackLoop>,
    frame_period: Duration,
    publisher: Option<Publisher>,
    poll: Option<JoinHandle<()>>,
}

impl FallbackPath {
    pub fn new(context: &PipelineContext, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let analyser = AnalyserNode::new(config.fft_size, config.analyser)
            .map_err(|e| CaptureError::Config(e.to_string()))?;
        let frame_period = frame_period(config.frame_rate);

        Ok(Self {
            pending: Some(FallbackLoop {
                time_domain: vec![0.0; analyser.fft_size()],
                magnitudes: vec![0.0; analyser.frequency_bin_count()],
                analyser,
                extractor: FeatureExtractor::from_config(config),
                context: context.clone(),
            }),
            frame_period,
            publisher: None,
            poll: None,
        })
    }

    pub fn activate(&mut self, source: &SourceNode, publisher: Publisher) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        source.connect(pending.analyser.input());

        self.publisher = Some(publisher.clone());
        self.poll = Some(tokio::spawn(pending.run(self.frame_period, publisher)));
    }

    /// Cancels the pending tick, then stops the loop.
    pub fn cancel(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.deactivate();
        }
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        self.pending = None;
    }
}

fn frame_period(frame_rate: f32) -> Duration {
    Duration::try_from_secs_f32(1.0 / frame_rate)
        .unwrap_or(MIN_FRAME_PERIOD)
        .max(MIN_FRAME_PERIOD)
}

impl Drop for FallbackPath {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct FallbackLoop {
    analyser: AnalyserNode,
    extractor: FeatureExtractor,
    context: PipelineContext,
    time_domain: Vec<f32>,
    magnitudes: Vec<f32>,
}

impl FallbackLoop {
    fn tick(&mut self, dt: f32) -> AudioFeatures {
        self.analyser.get_float_time_domain_data(&mut self.time_domain);
        if let Err(err) = self.analyser.get_byte_frequency_data(&mut self.magnitudes) {
            tracing::warn!(%err, "frequency analysis failed; treating spectrum as silent");
            self.magnitudes.fill(0.0);
        }

        self.extractor.process(
            &self.time_domain,
            &self.magnitudes,
            self.context.current_time(),
            dt,
        )
    }

    async fn run(mut self, period: Duration, publisher: Publisher) {
        let mut frames = time::interval(period);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<Instant> = None;

        loop {
            let now = frames.tick().await;
            if !publisher.is_active() {
                break;
            }

            let dt = last
                .map(|last| now.duration_since(last).as_secs_f32())
                .unwrap_or(period.as_secs_f32());
            last = Some(now);

            let features = self.tick(dt);
            if !publisher.publish(features) {
                break;
            }
        }
        tracing::debug!("fallback feature loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{f32::consts::PI, sync::Arc};

    use tokio::sync::watch;

    use super::*;
    use crate::{DeviceStream, SampleTap};

    fn sine_block(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * 32.0 * i as f32 / len as f32).sin())
            .collect()
    }

    #[test]
    fn tick_reads_latest_window() {
        let context = PipelineContext::new(48_000);
        context.resume().unwrap();
        let config = CaptureConfig {
            fft_size: 256,
            ..Default::default()
        };
        let mut path = FallbackPath::new(&context, &config).unwrap();
        let mut pending = path.pending.take().unwrap();

        let mut input = pending.analyser.input();
        input(&sine_block(256, 1.0));

        let features = pending.tick(1.0 / 60.0);
        let expected = 0.15 * std::f32::consts::FRAC_1_SQRT_2;
        assert!((features.rms - expected).abs() < 1e-3);
        assert!(features.centroid > 0.0 && features.centroid <= 1.0);
        assert!((features.onset - 0.15).abs() < 1e-6);
    }

    #[test]
    fn tick_honours_configured_onset_gain() {
        let context = PipelineContext::new(48_000);
        context.resume().unwrap();
        let config = CaptureConfig {
            fft_size: 256,
            smoothing: 0.0,
            onset_gain: 2.0,
            ..Default::default()
        };
        let mut path = FallbackPath::new(&context, &config).unwrap();
        let mut pending = path.pending.take().unwrap();

        let mut input = pending.analyser.input();
        input(&sine_block(256, 0.2));

        let features = pending.tick(1.0 / 60.0);
        let rms = 0.2 * std::f32::consts::FRAC_1_SQRT_2;
        assert!((features.rms - rms).abs() < 1e-4);
        assert!((features.onset - 2.0 * rms).abs() < 1e-4);
    }

    #[test]
    fn frame_period_never_reaches_zero() {
        assert_eq!(frame_period(2.0), Duration::from_millis(500));
        assert_eq!(frame_period(1e10), MIN_FRAME_PERIOD);
        assert_eq!(frame_period(f32::INFINITY), MIN_FRAME_PERIOD);
        assert_eq!(frame_period(0.0), MIN_FRAME_PERIOD);
    }

    #[tokio::test]
    async fn loop_publishes_until_cancelled() {
        let context = PipelineContext::new(48_000);
        context.resume().unwrap();
        let tap = SampleTap::new(context.clone());
        let stream = DeviceStream::new("test", tap.clone(), Vec::new());
        let source = SourceNode::from_stream(&stream);

        let config = CaptureConfig {
            fft_size: 512,
            frame_rate: 200.0,
            ..Default::default()
        };
        let (tx, mut rx) = watch::channel(AudioFeatures::ZERO);
        let sink = Arc::new(tx);
        let mut path = FallbackPath::new(&context, &config).unwrap();
        path.activate(&source, Publisher::new(sink.clone()));
        assert!(source.is_connected());

        tap.push_block(&sine_block(512, 0.5));
        time::timeout(Duration::from_secs(2), rx.wait_for(|f| f.rms > 0.0))
            .await
            .expect("fallback loop should publish")
            .unwrap();
        let features = *rx.borrow();
        assert!(features.t > 0.0);

        path.cancel();
        sink.send_replace(AudioFeatures::ZERO);
        time::sleep(Duration::from_millis(30)).await;
        assert!(rx.borrow().is_zero());
    }
}
