//! Capabilities the capture controller needs from the host environment.

mod cpal_host;
#[cfg(test)]
pub(crate) mod mock;

use crate::{CaptureConstraints, DeviceStream, PipelineContext, PlatformError};

pub use cpal_host::{list_input_devices, CpalPlatform, InputDeviceInfo};

/// Host environment of the capture controller.
///
/// The probes are checked in order by `start()`; a platform that reports a
/// capability as missing is never asked to use it. Blocking methods may wait
/// on the operating system (device permission prompts, driver start-up) and
/// are called off the async executor.
pub trait Platform: Send + Sync + 'static {
    /// Whether capture is allowed in the current execution context.
    fn is_secure_context(&self) -> bool;

    /// Whether audio devices can be captured at all.
    fn supports_capture(&self) -> bool;

    /// Whether an audio pipeline context can be constructed.
    fn supports_pipeline(&self) -> bool;

    fn create_context(&self) -> Result<PipelineContext, PlatformError>;

    /// Requests a device stream feeding `context`. May block.
    fn open_stream(
        &self,
        context: &PipelineContext,
        constraints: &CaptureConstraints,
    ) -> Result<DeviceStream, PlatformError>;

    /// Loads the processing module `name` into `context` so a
    /// [`crate::WorkletNode`] can be built from it. May block.
    ///
    /// Platforms without isolated audio processing keep the default, which
    /// makes the controller use the polling path.
    fn load_module(&self, context: &PipelineContext, name: &str) -> Result<(), PlatformError> {
        let _ = context;
        Err(PlatformError::ModuleUnavailable(name.to_string()))
    }
}
