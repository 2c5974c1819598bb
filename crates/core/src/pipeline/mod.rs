//! Audio pipeline resources owned by the capture controller.

mod analyser;
mod stream;
mod worklet;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::PlatformError;

pub use analyser::{AnalyserNode, SampleRing};
pub use stream::{BlockSink, CaptureTrack, DeviceStream, SampleTap, SourceNode};
pub use worklet::{FeatureProcessor, WorkletNode, WorkletOptions, FEATURE_PROCESSOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// Handle to an audio pipeline running at a fixed sample rate.
///
/// The clock counts frames delivered by the device stream while the context
/// is running, so both feature paths stamp features against the same time
/// base. Clones share the same underlying context.
#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    sample_rate: u32,
    state: Mutex<ContextState>,
    frames: AtomicU64,
    modules: Mutex<HashSet<String>>,
}

impl PipelineContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                sample_rate: sample_rate.max(1),
                state: Mutex::new(ContextState::Suspended),
                frames: AtomicU64::new(0),
                modules: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContextState::Closed
    }

    pub fn resume(&self) -> Result<(), PlatformError> {
        let mut state = self.inner.state.lock();
        match *state {
            ContextState::Closed => Err(PlatformError::ContextClosed),
            _ => {
                *state = ContextState::Running;
                Ok(())
            }
        }
    }

    /// Closes the context. Closing twice is an error.
    pub fn close(&self) -> Result<(), PlatformError> {
        let mut state = self.inner.state.lock();
        if *state == ContextState::Closed {
            return Err(PlatformError::ContextClosed);
        }
        *state = ContextState::Closed;
        self.inner.modules.lock().clear();
        Ok(())
    }

    /// Pipeline clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.inner.frames.load(Ordering::Acquire) as f64 / self.inner.sample_rate as f64
    }

    pub(crate) fn advance(&self, frames: usize) {
        if self.state() == ContextState::Running {
            self.inner
                .frames
                .fetch_add(frames as u64, Ordering::AcqRel);
        }
    }

    /// Makes a processing module available to [`WorkletNode::new`].
    pub fn register_module(&self, name: &str) -> Result<(), PlatformError> {
        if self.is_closed() {
            return Err(PlatformError::ContextClosed);
        }
        self.inner.modules.lock().insert(name.to_string());
        Ok(())
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.inner.modules.lock().contains(name)
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("sample_rate", &self.inner.sample_rate)
            .field("state", &self.state())
            .field("time", &self.current_time())
            .finish()
    }
}
