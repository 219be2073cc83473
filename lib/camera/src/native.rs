use crate::{
    CameraError, CameraResult,
    backend::{CameraBackend, CameraDevice},
    camera_info::{
        CameraInfo, DeviceCapabilities, Facing, FocusMode, FpsRange, PreviewParams, PreviewSize,
    },
};
use gpu_surface::FrameProducer;
use nokhwa::{
    CallbackCamera,
    pixel_format::RgbAFormat,
    query,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution},
};

pub fn init() {
    #[cfg(target_os = "macos")]
    nokhwa::nokhwa_initialize(|granted| {
        log::info!("User said {} for nokhwa", granted);
    });
}

/// Cameras reachable through nokhwa. Desktop cameras carry no facing, so the
/// first one is reported as front and the rest as back.
#[derive(Default)]
pub struct NativeBackend {
    cameras: Vec<(CameraInfo, CameraIndex)>,
}

impl NativeBackend {
    pub fn new() -> Self {
        init();
        Self::default()
    }
}

fn requested_format() -> RequestedFormat<'static> {
    RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate)
}

impl CameraBackend for NativeBackend {
    fn list_cameras(&mut self) -> CameraResult<Vec<CameraInfo>> {
        self.cameras = query(ApiBackend::Auto)?
            .into_iter()
            .enumerate()
            .map(|(i, camera)| {
                let info = CameraInfo {
                    id: camera.index().to_string(),
                    name: camera.human_name(),
                    facing: if i == 0 { Facing::Front } else { Facing::Back },
                    sensor_orientation: 0,
                };
                (info, camera.index().clone())
            })
            .collect();

        Ok(self.cameras.iter().map(|(info, _)| info.clone()).collect())
    }

    fn open(&mut self, camera: &CameraInfo) -> CameraResult<Box<dyn CameraDevice>> {
        let index = self
            .cameras
            .iter()
            .find(|(info, _)| info.id == camera.id)
            .map(|(_, index)| index.clone())
            .ok_or_else(|| CameraError::DeviceUnavailable(camera.name.clone()))?;

        Ok(Box::new(NativeCamera {
            info: camera.clone(),
            index,
            params: None,
            camera: None,
        }))
    }
}

struct NativeCamera {
    info: CameraInfo,
    index: CameraIndex,
    params: Option<PreviewParams>,
    camera: Option<CallbackCamera>,
}

impl CameraDevice for NativeCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn capabilities(&mut self) -> CameraResult<DeviceCapabilities> {
        let mut camera = CallbackCamera::new(self.index.clone(), requested_format(), |_| {})?;
        let formats = camera.compatible_camera_formats()?;

        let mut preview_sizes = vec![];
        let mut fps_ranges = vec![];
        for format in &formats {
            let size = PreviewSize::new(format.resolution().width(), format.resolution().height());
            if !preview_sizes.contains(&size) {
                preview_sizes.push(size);
            }

            let fps = FpsRange::new(format.frame_rate() * 1000, format.frame_rate() * 1000);
            if !fps_ranges.contains(&fps) {
                fps_ranges.push(fps);
            }
        }

        let default_size = preview_sizes
            .first()
            .copied()
            .unwrap_or(PreviewSize::new(640, 480));
        let current_fps_range = fps_ranges
            .first()
            .copied()
            .unwrap_or(FpsRange::new(30000, 30000));

        Ok(DeviceCapabilities {
            preview_sizes,
            default_size,
            fps_ranges,
            current_fps_range,
            focus_modes: vec![FocusMode::Fixed],
        })
    }

    fn configure(&mut self, params: &PreviewParams) -> CameraResult<PreviewParams> {
        self.params = Some(params.clone());
        Ok(params.clone())
    }

    fn start_preview(&mut self, output: FrameProducer) -> CameraResult<()> {
        if self.camera.is_some() {
            return Ok(());
        }

        let params = self
            .params
            .clone()
            .ok_or_else(|| CameraError::ConfigurationError("device not configured".to_string()))?;

        let mut camera =
            CallbackCamera::new(self.index.clone(), requested_format(), move |buffer| {
                match buffer.decode_image::<RgbAFormat>() {
                    Ok(frame) => {
                        output.queue_frame(frame);
                    }
                    Err(e) => log::warn!("decode camera frame failed: {e}"),
                }
            })
            .map_err(|e| CameraError::ConfigurationError(e.to_string()))?;

        let fps = params.fps_range.max / 1000;
        if let Err(e) = camera.set_frame_rate(fps) {
            log::warn!("camera set frame rate ({fps}) failed: {e}");
        }

        let PreviewSize { width, height } = params.size;
        camera
            .set_resolution(Resolution::new(width, height))
            .map_err(|e| CameraError::ConfigurationError(e.to_string()))?;

        camera
            .open_stream()
            .map_err(|e| CameraError::ConfigurationError(e.to_string()))?;
        self.camera = Some(camera);
        Ok(())
    }

    fn stop_preview(&mut self) {
        if let Some(mut camera) = self.camera.take()
            && let Err(e) = camera.stop_stream()
        {
            log::warn!("stop camera stream failed: {e}");
        }
    }
}

impl Drop for NativeCamera {
    fn drop(&mut self) {
        self.stop_preview();
    }
}
