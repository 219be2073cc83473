use crate::{
    CameraResult,
    camera_info::{CameraInfo, DeviceCapabilities, PreviewParams},
};
use gpu_surface::FrameProducer;

/// Enumerates and opens camera devices.
pub trait CameraBackend: Send + 'static {
    fn list_cameras(&mut self) -> CameraResult<Vec<CameraInfo>>;

    fn open(&mut self, camera: &CameraInfo) -> CameraResult<Box<dyn CameraDevice>>;
}

/// An opened camera. Dropping it must free the underlying device.
pub trait CameraDevice: Send {
    fn info(&self) -> &CameraInfo;

    fn capabilities(&mut self) -> CameraResult<DeviceCapabilities>;

    /// Applies `params` and returns what the device actually settled on.
    fn configure(&mut self, params: &PreviewParams) -> CameraResult<PreviewParams>;

    /// Starts pushing frames into `output` until `stop_preview`.
    fn start_preview(&mut self, output: FrameProducer) -> CameraResult<()>;

    /// No frame reaches the producer once this returns.
    fn stop_preview(&mut self);
}
