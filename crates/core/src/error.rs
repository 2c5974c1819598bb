/// Result alias that carries the custom [`VizError`] type.
pub type Result<T> = std::result::Result<T, VizError>;

/// General error type for the core crate outside the capture lifecycle
/// (configuration loading, offline analysis input).
#[derive(Debug, thiserror::Error)]
pub enum VizError {
    /// Input that the analysis routines cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Caller-facing failures of [`crate::CaptureController::start`].
///
/// Every variant is recoverable: the controller has already released all
/// partially acquired resources by the time one of these is returned, and a
/// fresh `start()` begins from a clean slate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("insecure-context: microphone capture requires a secure context")]
    InsecureContext,
    #[error("capture-unsupported: this platform cannot capture audio devices")]
    CaptureUnsupported,
    #[error("audio-api-unavailable: no audio pipeline is available on this platform")]
    AudioApiUnavailable,
    #[error("permission-denied: {0}")]
    PermissionDenied(String),
    #[error("device stream unavailable: {0}")]
    DeviceStream(String),
    #[error("audio pipeline failure: {0}")]
    Pipeline(String),
    /// `stop()` ran while this `start()` was suspended.
    #[error("capture start was cancelled by stop()")]
    Cancelled,
    #[error("invalid capture configuration: {0}")]
    Config(String),
}

/// Failures reported by a [`crate::Platform`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("pipeline context error: {0}")]
    Context(String),
    #[error("pipeline context is already closed")]
    ContextClosed,
    #[error("processing module `{0}` could not be loaded")]
    ModuleUnavailable(String),
    #[error("processing node `{0}` is not registered")]
    NodeUnavailable(String),
}

impl From<PlatformError> for CaptureError {
    fn from(value: PlatformError) -> Self {
        match value {
            PlatformError::PermissionDenied(reason) => Self::PermissionDenied(reason),
            PlatformError::DeviceNotFound(_) | PlatformError::Stream(_) => {
                Self::DeviceStream(value.to_string())
            }
            PlatformError::Context(_)
            | PlatformError::ContextClosed
            | PlatformError::ModuleUnavailable(_)
            | PlatformError::NodeUnavailable(_) => Self::Pipeline(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_carry_taxonomy_prefix() {
        assert!(CaptureError::InsecureContext
            .to_string()
            .starts_with("insecure-context"));
        assert!(CaptureError::CaptureUnsupported
            .to_string()
            .starts_with("capture-unsupported"));
        assert!(CaptureError::AudioApiUnavailable
            .to_string()
            .starts_with("audio-api-unavailable"));
    }

    #[test]
    fn platform_permission_maps_to_permission_denied() {
        let err: CaptureError = PlatformError::PermissionDenied("user said no".into()).into();
        assert_eq!(err, CaptureError::PermissionDenied("user said no".into()));
        assert!(err.to_string().starts_with("permission-denied"));
    }

    #[test]
    fn device_failures_map_to_device_stream() {
        let err: CaptureError = PlatformError::DeviceNotFound("usb mic".into()).into();
        assert!(matches!(err, CaptureError::DeviceStream(msg) if msg.contains("usb mic")));
    }

    #[test]
    fn capture_failures_surface_unchanged_through_viz_error() {
        let err: VizError = CaptureError::InsecureContext.into();
        assert_eq!(err.to_string(), CaptureError::InsecureContext.to_string());

        let err: VizError = PlatformError::ContextClosed.into();
        assert!(matches!(err, VizError::Platform(PlatformError::ContextClosed)));
    }
}
