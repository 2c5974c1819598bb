use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::PipelineContext;

/// Consumer of mono sample blocks, invoked on the device callback thread.
pub type BlockSink = Box<dyn FnMut(&[f32]) + Send>;

/// Entry point of captured audio into the pipeline.
///
/// The device callback pushes every mono block here; the tap advances the
/// pipeline clock and hands the block to whichever node is connected. A
/// stream that dies reports it through [`SampleTap::fail`].
pub struct SampleTap {
    context: PipelineContext,
    sink: Mutex<Option<BlockSink>>,
    failure: watch::Sender<Option<String>>,
}

impl SampleTap {
    pub fn new(context: PipelineContext) -> Arc<Self> {
        let (failure, _) = watch::channel(None);
        Arc::new(Self {
            context,
            sink: Mutex::new(None),
            failure,
        })
    }

    /// Marks the stream as failed. Only the first reason is kept.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.failure.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Observes the failure reason; `None` while the stream is healthy.
    pub fn failures(&self) -> watch::Receiver<Option<String>> {
        self.failure.subscribe()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn push_block(&self, block: &[f32]) {
        if block.is_empty() {
            return;
        }
        self.context.advance(block.len());
        // Never block the device thread; a block that races a
        // connect/disconnect is dropped.
        if let Some(mut sink) = self.sink.try_lock() {
            if let Some(sink) = sink.as_mut() {
                sink(block);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    fn connect(&self, sink: BlockSink) {
        *self.sink.lock() = Some(sink);
    }

    fn disconnect(&self) -> bool {
        self.sink.lock().take().is_some()
    }
}

/// One live capture from a device.
pub trait CaptureTrack: Send {
    fn label(&self) -> &str;

    fn is_live(&self) -> bool;

    /// Stops capturing and releases the device. Stopping twice is a no-op.
    fn stop(&mut self);
}

/// Device stream granted by the platform, made of one or more tracks that
/// all feed the same [`SampleTap`].
pub struct DeviceStream {
    label: String,
    tap: Arc<SampleTap>,
    tracks: Vec<Box<dyn CaptureTrack>>,
}

impl DeviceStream {
    pub fn new(label: impl Into<String>, tap: Arc<SampleTap>, tracks: Vec<Box<dyn CaptureTrack>>) -> Self {
        Self {
            label: label.into(),
            tap,
            tracks,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tap(&self) -> &Arc<SampleTap> {
        &self.tap
    }

    pub fn failures(&self) -> watch::Receiver<Option<String>> {
        self.tap.failures()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|track| track.is_live()).count()
    }

    pub fn stop(&mut self) {
        for track in &mut self.tracks {
            if track.is_live() {
                tracing::debug!(track = track.label(), "stopping capture track");
                track.stop();
            }
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStream")
            .field("label", &self.label)
            .field("tracks", &self.tracks.len())
            .field("live", &self.live_tracks())
            .finish()
    }
}

/// Source node created from a device stream; routes its blocks to a single
/// downstream consumer.
pub struct SourceNode {
    tap: Arc<SampleTap>,
}

impl SourceNode {
    pub fn from_stream(stream: &DeviceStream) -> Self {
        Self {
            tap: stream.tap().clone(),
        }
    }

    pub fn connect(&self, sink: BlockSink) {
        self.tap.connect(sink);
    }

    /// Detaches the downstream consumer; returns whether one was attached.
    pub fn disconnect(&self) -> bool {
        self.tap.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.tap.is_connected()
    }
}

impl fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNode")
            .field("connected", &self.is_connected())
            .finish()
    }
}
