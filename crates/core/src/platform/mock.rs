//! In-memory platform for exercising the controller without audio hardware.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};

use parking_lot::Mutex;

use super::Platform;
use crate::{
    CaptureConstraints, CaptureTrack, DeviceStream, PipelineContext, PlatformError, SampleTap,
};

pub(crate) struct MockPlatform {
    pub secure: bool,
    pub capture: bool,
    pub pipeline: bool,
    pub module: bool,
    pub stream_error: Mutex<Option<PlatformError>>,
    pub sample_rate: u32,
    pub gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub contexts: Mutex<Vec<PipelineContext>>,
    pub taps: Mutex<Vec<Arc<SampleTap>>>,
    pub constraints: Mutex<Vec<CaptureConstraints>>,
    pub streams_opened: AtomicUsize,
    pub live_tracks: Arc<AtomicUsize>,
}

impl MockPlatform {
    pub fn full() -> Self {
        Self {
            secure: true,
            capture: true,
            pipeline: true,
            module: true,
            stream_error: Mutex::new(None),
            sample_rate: 48_000,
            gate: Mutex::new(None),
            contexts: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
            constraints: Mutex::new(Vec::new()),
            streams_opened: AtomicUsize::new(0),
            live_tracks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `open_stream` wait until the returned sender fires
    /// (or is dropped).
    pub fn gate_stream(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    /// Makes the next `open_stream` fail with `err`.
    pub fn fail_next_stream(&self, err: PlatformError) {
        *self.stream_error.lock() = Some(err);
    }

    /// Reports a device failure on the most recently opened stream.
    pub fn fail_stream(&self, reason: &str) {
        if let Some(tap) = self.last_tap() {
            tap.fail(reason);
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts
            .lock()
            .iter()
            .filter(|context| !context.is_closed())
            .count()
    }

    pub fn last_tap(&self) -> Option<Arc<SampleTap>> {
        self.taps.lock().last().cloned()
    }
}

impl Platform for MockPlatform {
    fn is_secure_context(&self) -> bool {
        self.secure
    }

    fn supports_capture(&self) -> bool {
        self.capture
    }

    fn supports_pipeline(&self) -> bool {
        self.pipeline
    }

    fn create_context(&self) -> Result<PipelineContext, PlatformError> {
        let context = PipelineContext::new(self.sample_rate);
        self.contexts.lock().push(context.clone());
        Ok(context)
    }

    fn open_stream(
        &self,
        context: &PipelineContext,
        constraints: &CaptureConstraints,
    ) -> Result<DeviceStream, PlatformError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        self.constraints.lock().push(*constraints);
        if let Some(err) = self.stream_error.lock().take() {
            return Err(err);
        }

        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        let tap = SampleTap::new(context.clone());
        self.taps.lock().push(tap.clone());
        let track = MockTrack {
            live: true,
            live_tracks: self.live_tracks.clone(),
        };
        Ok(DeviceStream::new("mock input", tap, vec![Box::new(track)]))
    }

    fn load_module(&self, context: &PipelineContext, name: &str) -> Result<(), PlatformError> {
        if self.module {
            context.register_module(name)
        } else {
            Err(PlatformError::ModuleUnavailable(name.to_string()))
        }
    }
}

struct MockTrack {
    live: bool,
    live_tracks: Arc<AtomicUsize>,
}

impl CaptureTrack for MockTrack {
    fn label(&self) -> &str {
        "mock input"
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
