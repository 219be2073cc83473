use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("No usable GPU adapter: {0}")]
    NoAdapter(String),

    #[error("GPU device error: {0}")]
    Device(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("No context is current on this thread")]
    NotCurrent,

    #[error("Context {0} is current on another thread")]
    ContextBusy(u64),

    #[error("Surface is no longer valid")]
    SurfaceInvalid,

    #[error("Surface was created by a different context")]
    SurfaceMismatch,

    #[error("Invalid texture: {0}")]
    InvalidTexture(u32),

    #[error("Object already released")]
    Released,
}

pub type Result<T> = std::result::Result<T, GpuError>;
