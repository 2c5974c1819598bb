//! Capture lifecycle: acquires the device, selects a feature path and
//! publishes [`AudioFeatures`] until stopped.

mod fallback;
mod path;

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    AudioFeatures, CaptureConfig, CaptureError, DeviceStream, PipelineContext, Platform,
    PlatformError, SourceNode, WorkletNode, WorkletOptions, FEATURE_PROCESSOR,
};

use fallback::FallbackPath;
use path::{FeaturePath, WorkletPath};

pub use path::PathKind;

/// Lifecycle state of a [`CaptureController`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    Starting,
    Running,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Idle => "idle",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}

/// Everything a running session holds. Committed to the controller only
/// when complete; dropping a partial set releases what it has.
#[derive(Default)]
struct ResourceSet {
    context: Option<PipelineContext>,
    stream: Option<DeviceStream>,
    source: Option<SourceNode>,
    path: Option<FeaturePath>,
    monitor: Option<JoinHandle<()>>,
}

impl ResourceSet {
    fn is_complete(&self) -> bool {
        self.context.is_some() && self.stream.is_some() && self.source.is_some() && self.path.is_some()
    }

    fn is_empty(&self) -> bool {
        self.context.is_none()
            && self.stream.is_none()
            && self.source.is_none()
            && self.path.is_none()
            && self.monitor.is_none()
    }

    fn activate(&mut self, sink: &Arc<watch::Sender<AudioFeatures>>) {
        if let (Some(source), Some(path)) = (&self.source, &mut self.path) {
            path.activate(source, sink);
        }
    }

    fn live_tracks(&self) -> usize {
        self.stream.as_ref().map_or(0, DeviceStream::live_tracks)
    }

    /// Stops everything that can still publish. Never blocks.
    fn cancel(&mut self) {
        if let Some(mut path) = self.path.take() {
            path.cancel();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    /// Tears down in dependency order. Individual failures are logged and
    /// never stop the remaining steps. Stopping the stream may join the
    /// capture thread.
    fn release(&mut self) {
        self.cancel();
        if let Some(source) = self.source.take() {
            source.disconnect();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if let Some(context) = self.context.take() {
            if let Err(err) = context.close() {
                tracing::debug!(%err, "ignoring pipeline close failure");
            }
        }
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases `resources` on the blocking pool once nothing can publish.
async fn release_off_thread(mut resources: ResourceSet) {
    if resources.is_empty() {
        return;
    }
    resources.cancel();
    if let Err(err) = tokio::task::spawn_blocking(move || resources.release()).await {
        tracing::warn!(%err, "capture resource release did not complete");
    }
}

struct ControllerState {
    status: Status,
    error: Option<String>,
    resources: ResourceSet,
    /// Bumped by every start, stop and stream failure; work that wakes up
    /// into a newer session abandons what it acquired.
    session: u64,
}

/// State shared with the stream-failure monitor of the running session.
struct Shared {
    state: Mutex<ControllerState>,
    features: Arc<watch::Sender<AudioFeatures>>,
    status_tx: watch::Sender<Status>,
}

impl Shared {
    fn set_status(&self, state: &mut ControllerState, status: Status) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Moves to idle and hands back whatever the controller held.
    fn detach(&self) -> ResourceSet {
        let mut state = self.state.lock();
        state.session += 1;
        state.error = None;
        if state.status != Status::Idle {
            tracing::info!(from = %state.status, "audio capture stopping");
        }
        self.set_status(&mut state, Status::Idle);
        std::mem::take(&mut state.resources)
    }

    /// Running to error: full teardown first, then the status change.
    async fn stream_failed(&self, session: u64, reason: String) {
        let (session, mut resources) = {
            let mut state = self.state.lock();
            if state.session != session || state.status != Status::Running {
                return;
            }
            state.session += 1;
            (state.session, std::mem::take(&mut state.resources))
        };
        tracing::warn!(%reason, "audio capture stream failed");

        // The monitor is the caller; aborting it would cut this teardown short.
        drop(resources.monitor.take());
        release_off_thread(resources).await;
        self.features.send_replace(AudioFeatures::ZERO);

        let mut state = self.state.lock();
        if state.session == session {
            state.error = Some(CaptureError::DeviceStream(reason).to_string());
            self.set_status(&mut state, Status::Error);
        }
    }
}

/// Resets a start that was dropped before it finished. Whatever it had
/// acquired is released by the dropped acquisition itself.
struct StartGuard<'a> {
    shared: &'a Shared,
    session: u64,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.session == self.session && state.status == Status::Starting {
            tracing::info!("audio capture start abandoned");
            state.session += 1;
            self.shared.set_status(&mut state, Status::Idle);
        }
    }
}

/// Point-in-time view of the public controller surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSnapshot {
    pub status: Status,
    pub features: AudioFeatures,
    pub error: Option<String>,
}

/// Read side of the feature output, one per consumer.
#[derive(Clone)]
pub struct FeatureHandle {
    rx: watch::Receiver<AudioFeatures>,
}

impl FeatureHandle {
    /// Latest published features.
    pub fn latest(&self) -> AudioFeatures {
        *self.rx.borrow()
    }

    /// Waits for the next publication. Fails once the controller is gone.
    pub async fn changed(&mut self) -> Result<AudioFeatures, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(*self.rx.borrow_and_update())
    }
}

impl fmt::Debug for FeatureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureHandle").finish()
    }
}

/// Owner of the capture resources and the status state machine.
///
/// All resource mutation goes through this type. Dropping the controller
/// performs the same teardown as [`CaptureController::stop`].
pub struct CaptureController {
    platform: Arc<dyn Platform>,
    config: CaptureConfig,
    shared: Arc<Shared>,
}

impl CaptureController {
    pub fn new(platform: Arc<dyn Platform>, config: CaptureConfig) -> Self {
        let (features, _) = watch::channel(AudioFeatures::ZERO);
        let (status_tx, _) = watch::channel(Status::Idle);
        Self {
            platform,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState {
                    status: Status::Idle,
                    error: None,
                    resources: ResourceSet::default(),
                    session: 0,
                }),
                features: Arc::new(features),
                status_tx,
            }),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().status
    }

    pub fn features(&self) -> AudioFeatures {
        *self.shared.features.borrow()
    }

    /// Message of the last failure, cleared by the next start or stop.
    pub fn error(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        let state = self.shared.state.lock();
        CaptureSnapshot {
            status: state.status,
            features: self.features(),
            error: state.error.clone(),
        }
    }

    pub fn subscribe(&self) -> FeatureHandle {
        FeatureHandle {
            rx: self.shared.features.subscribe(),
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status_tx.subscribe()
    }

    /// Feature strategy of the running session.
    pub fn active_path(&self) -> Option<PathKind> {
        self.shared
            .state
            .lock()
            .resources
            .path
            .as_ref()
            .map(FeaturePath::kind)
    }

    /// Device-stream tracks currently held by the controller.
    pub fn live_tracks(&self) -> usize {
        self.shared.state.lock().resources.live_tracks()
    }

    /// Acquires the device and begins publishing features.
    ///
    /// A no-op while already starting or running. On failure every
    /// partially acquired resource is released, the status becomes
    /// [`Status::Error`] and the error is returned once; calling `start`
    /// again retries from scratch. If [`stop`](Self::stop) runs while this
    /// call is suspended, it returns [`CaptureError::Cancelled`] and leaves
    /// the controller idle. Dropping the returned future before it
    /// completes also leaves the controller idle.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let (session, stale) = {
            let mut state = self.shared.state.lock();
            if matches!(state.status, Status::Starting | Status::Running) {
                tracing::debug!(status = %state.status, "start ignored");
                return Ok(());
            }
            state.session += 1;
            state.error = None;
            let stale = std::mem::take(&mut state.resources);
            self.shared.set_status(&mut state, Status::Starting);
            (state.session, stale)
        };
        let _guard = StartGuard {
            shared: &self.shared,
            session,
        };
        release_off_thread(stale).await;
        self.shared.features.send_replace(AudioFeatures::ZERO);

        match self.acquire(session).await {
            Ok(resources) => self.commit(session, resources),
            Err(CaptureError::Cancelled) => {
                tracing::info!("audio capture start cancelled");
                Err(CaptureError::Cancelled)
            }
            Err(err) if self.fail(session, &err) => Err(err),
            Err(_) => Err(CaptureError::Cancelled),
        }
    }

    /// Releases every resource and returns to [`Status::Idle`] with zeroed
    /// features. Safe from any state, including while a start is pending.
    pub async fn stop(&self) {
        let resources = self.shared.detach();
        release_off_thread(resources).await;
        self.shared.features.send_replace(AudioFeatures::ZERO);
    }

    async fn acquire(&self, session: u64) -> Result<ResourceSet, CaptureError> {
        if !self.platform.is_secure_context() {
            return Err(CaptureError::InsecureContext);
        }
        if !self.platform.supports_capture() {
            return Err(CaptureError::CaptureUnsupported);
        }
        if !self.platform.supports_pipeline() {
            return Err(CaptureError::AudioApiUnavailable);
        }
        self.config
            .validate()
            .map_err(|err| CaptureError::Config(err.to_string()))?;

        let mut resources = ResourceSet::default();
        let context = self.platform.create_context()?;
        resources.context = Some(context.clone());
        context.resume()?;

        let stream = {
            let context = context.clone();
            let constraints = self.config.constraints;
            self.run_blocking(move |platform| platform.open_stream(&context, &constraints))
                .await?
        };
        let source = SourceNode::from_stream(&stream);
        resources.stream = Some(stream);
        resources.source = Some(source);
        self.ensure_current(session)?;

        resources.path = Some(self.select_path(&context).await?);
        self.ensure_current(session)?;

        debug_assert!(resources.is_complete());
        Ok(resources)
    }

    /// Tries the block-synchronous path and falls back to polling on any
    /// failure to load or construct it.
    async fn select_path(&self, context: &PipelineContext) -> Result<FeaturePath, CaptureError> {
        let module_context = context.clone();
        let worklet = self
            .run_blocking(move |platform| platform.load_module(&module_context, FEATURE_PROCESSOR))
            .await
            .and_then(|()| WorkletNode::new(context, FEATURE_PROCESSOR, self.worklet_options()));

        match worklet {
            Ok(node) => {
                tracing::info!(options = ?node.options(), "using block-synchronous feature path");
                Ok(FeaturePath::Worklet(WorkletPath::new(node)))
            }
            Err(err) => {
                tracing::warn!(%err, "block-synchronous feature path unavailable, polling instead");
                Ok(FeaturePath::Fallback(FallbackPath::new(context, &self.config)?))
            }
        }
    }

    fn worklet_options(&self) -> WorkletOptions {
        WorkletOptions {
            smoothing: self.config.smoothing,
            smoothing_mode: self.config.smoothing_mode,
            gain: self.config.gain,
            onset_gain: self.config.onset_gain,
        }
    }

    async fn run_blocking<T, F>(&self, call: F) -> Result<T, PlatformError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Platform) -> Result<T, PlatformError> + Send + 'static,
    {
        let platform = self.platform.clone();
        tokio::task::spawn_blocking(move || call(platform.as_ref()))
            .await
            .map_err(|e| PlatformError::Context(format!("platform call failed: {e}")))?
    }

    fn ensure_current(&self, session: u64) -> Result<(), CaptureError> {
        if self.shared.state.lock().session == session {
            Ok(())
        } else {
            Err(CaptureError::Cancelled)
        }
    }

    fn commit(&self, session: u64, mut resources: ResourceSet) -> Result<(), CaptureError> {
        let mut state = self.shared.state.lock();
        if state.session != session {
            return Err(CaptureError::Cancelled);
        }

        resources.activate(&self.shared.features);
        resources.monitor = resources
            .stream
            .as_ref()
            .map(|stream| spawn_monitor(Arc::downgrade(&self.shared), session, stream.failures()));
        let kind = resources.path.as_ref().map(FeaturePath::kind);
        state.resources = resources;
        self.shared.set_status(&mut state, Status::Running);
        tracing::info!(path = ?kind, "audio capture running");
        Ok(())
    }

    /// Records a failed start. Returns `false` when a later start or stop
    /// already superseded `session`.
    fn fail(&self, session: u64, err: &CaptureError) -> bool {
        let mut state = self.shared.state.lock();
        if state.session != session {
            return false;
        }
        tracing::warn!(%err, "audio capture failed to start");
        state.error = Some(err.to_string());
        self.shared.set_status(&mut state, Status::Error);
        debug_assert!(state.resources.is_empty());
        true
    }
}

/// Watches the running session's stream and tears the session down when
/// the device reports a failure.
fn spawn_monitor(
    shared: Weak<Shared>,
    session: u64,
    mut failures: watch::Receiver<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = match failures.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => return,
        };
        if let Some(shared) = shared.upgrade() {
            shared.stream_failed(session, reason).await;
        }
    })
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        let mut resources = self.shared.detach();
        resources.release();
        self.shared.features.send_replace(AudioFeatures::ZERO);
    }
}

impl fmt::Debug for CaptureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CaptureController")
            .field("status", &state.status)
            .field("error", &state.error)
            .field("path", &state.resources.path.as_ref().map(FeaturePath::kind))
            .finish()
    }
}
