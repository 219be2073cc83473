use thiserror::Error;

/// Error types for recording operations.
///
/// Device and GPU failures from the lower layers convert into this type, so
/// a recording session surfaces one error type to its caller:
///
/// - [`GpuError`](gpu_surface::GpuError) from context, surface and drawer calls
///   becomes [`RecorderError::Gpu`]
/// - [`CameraError`](camera::CameraError) from the capture source becomes
///   [`RecorderError::Camera`]
/// - [`MuxError`](mp4m::MuxError) from the multiplexer and the MP4 container
///   becomes [`RecorderError::Mux`]
///
/// Codec implementations report a rejected format from `configure` or
/// `start` as [`RecorderError::EncoderInitError`]. A session then rolls back
/// the encoders it already prepared or started before returning the error.
///
/// # Examples
/// ```
/// use recorder::{RecorderConfig, RecorderError, RecordingSession};
///
/// let config = RecorderConfig::new("clip.mp4").with_fps(0);
/// match RecordingSession::with_mp4(config) {
///     Err(RecorderError::InvalidConfig(reason)) => assert_eq!(reason, "fps is 0"),
///     Err(e) => panic!("unexpected error: {e}"),
///     Ok(_) => panic!("a zero frame rate must be rejected"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInitError(String),

    #[error("Codec failed: {0}")]
    Codec(String),

    #[error("Invalid configuration parameters: {0}")]
    InvalidConfig(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("GPU operation failed: {0}")]
    Gpu(#[from] gpu_surface::GpuError),

    #[error("Camera operation failed: {0}")]
    Camera(#[from] camera::CameraError),

    #[error("Multiplexer failed: {0}")]
    Mux(#[from] mp4m::MuxError),

    #[error("File operation failed: {0}")]
    FileOperationFailed(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
