pub mod backend;
pub mod camera_info;
pub mod capture_source;
pub mod negotiation;
pub mod test_pattern;

#[cfg(feature = "native")]
pub mod native;

pub use backend::{CameraBackend, CameraDevice};
pub use camera_info::{
    CameraInfo, DeviceCapabilities, Facing, FocusMode, FpsRange, PreviewParams, PreviewSize,
};
pub use capture_source::{CameraCaptureSource, CaptureConfig, CaptureSession, PreviewTarget};
pub use test_pattern::{PatternDevice, TestPatternBackend, TestPatternConfig};

#[cfg(feature = "native")]
pub use native::NativeBackend;

pub type CameraResult<T> = Result<T, CameraError>;

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("No camera available: {0}")]
    DeviceUnavailable(String),

    #[error("Camera rejected configuration: {0}")]
    ConfigurationError(String),

    #[error("Camera worker is not running")]
    WorkerGone,

    #[error("Camera backend error: {0}")]
    Backend(String),

    #[cfg(feature = "native")]
    #[error("Camera error: {0}")]
    NokhwaError(#[from] nokhwa::NokhwaError),
}
