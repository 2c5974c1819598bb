use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::fallback::FallbackPath;
use crate::{AudioFeatures, SourceNode, WorkletNode};

/// Which strategy produces features for the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    BlockSynchronous,
    Fallback,
}

/// Write access to the output sink for one feature path instance.
///
/// Publishing happens under the sink's lock and only while the path is
/// active, so nothing a cancelled path computes can land after teardown
/// resets the features.
#[derive(Clone)]
pub(crate) struct Publisher {
    sink: Arc<watch::Sender<AudioFeatures>>,
    active: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(sink: Arc<watch::Sender<AudioFeatures>>) -> Self {
        Self {
            sink,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Last value wins. Returns `false` once the path has been cancelled.
    pub fn publish(&self, features: AudioFeatures) -> bool {
        let mut published = false;
        self.sink.send_if_modified(|current| {
            if self.active.load(Ordering::Acquire) {
                *current = features;
                published = true;
            }
            published
        });
        published
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Feature strategy selected once per session.
pub(crate) enum FeaturePath {
    Worklet(WorkletPath),
    Fallback(FallbackPath),
}

impl FeaturePath {
    pub fn kind(&self) -> PathKind {
        match self {
            FeaturePath::Worklet(_) => PathKind::BlockSynchronous,
            FeaturePath::Fallback(_) => PathKind::Fallback,
        }
    }

    /// Wires the path to `source` and starts publishing into `sink`.
    pub fn activate(&mut self, source: &SourceNode, sink: &Arc<watch::Sender<AudioFeatures>>) {
        let publisher = Publisher::new(sink.clone());
        match self {
            FeaturePath::Worklet(path) => path.activate(source, publisher),
            FeaturePath::Fallback(path) => path.activate(source, publisher),
        }
    }

    pub fn cancel(&mut self) {
        match self {
            FeaturePath::Worklet(path) => path.cancel(),
            FeaturePath::Fallback(path) => path.cancel(),
        }
    }
}

/// Block-synchronous path: the processor runs on the device thread and the
/// host only forwards its messages.
pub(crate) struct WorkletPath {
    node: Option<WorkletNode>,
    publisher: Option<Publisher>,
    forwarder: Option<JoinHandle<()>>,
}

impl WorkletPath {
    pub fn new(node: WorkletNode) -> Self {
        Self {
            node: Some(node),
            publisher: None,
            forwarder: None,
        }
    }

    fn activate(&mut self, source: &SourceNode, publisher: Publisher) {
        let Some(node) = self.node.take() else {
            return;
        };
        let (processor, mut port) = node.into_parts();
        source.connect(processor);

        let forward = publisher.clone();
        self.publisher = Some(publisher);
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(features) = port.recv().await {
                if !forward.publish(newest(&mut port, features)) {
                    break;
                }
            }
        }));
    }

    /// Clears the message handler.
    fn cancel(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.deactivate();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.node = None;
    }
}

/// Skips past every message already queued behind `first`.
fn newest(port: &mut mpsc::Receiver<AudioFeatures>, first: AudioFeatures) -> AudioFeatures {
    let mut latest = first;
    while let Ok(features) = port.try_recv() {
        latest = features;
    }
    latest
}

impl Drop for WorkletPath {
    fn drop(&mut self) {
        self.cancel();
    }
}
