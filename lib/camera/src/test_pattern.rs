use crate::{
    CameraError, CameraResult,
    backend::{CameraBackend, CameraDevice},
    camera_info::{
        CameraInfo, DeviceCapabilities, Facing, FocusMode, FpsRange, PreviewParams, PreviewSize,
    },
};
use derivative::Derivative;
use derive_setters::Setters;
use gpu_surface::FrameProducer;
use image::{Rgba, RgbaImage};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// One synthetic device.
#[derive(Debug, Clone)]
pub struct PatternDevice {
    pub info: CameraInfo,
    pub capabilities: DeviceCapabilities,
}

impl PatternDevice {
    pub fn new(id: &str, facing: Facing, sensor_orientation: u32) -> Self {
        Self {
            info: CameraInfo {
                id: id.to_string(),
                name: format!("Test pattern {id}"),
                facing,
                sensor_orientation,
            },
            capabilities: DeviceCapabilities {
                preview_sizes: vec![
                    PreviewSize::new(160, 120),
                    PreviewSize::new(128, 72),
                    PreviewSize::new(320, 180),
                ],
                default_size: PreviewSize::new(160, 120),
                fps_ranges: vec![
                    FpsRange::new(15000, 15000),
                    FpsRange::new(15000, 30000),
                    FpsRange::new(30000, 30000),
                ],
                current_fps_range: FpsRange::new(15000, 30000),
                focus_modes: vec![FocusMode::Fixed, FocusMode::Auto],
            },
        }
    }

    pub fn with_preview_sizes(mut self, sizes: Vec<PreviewSize>) -> Self {
        self.capabilities.preview_sizes = sizes;
        self
    }
}

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct TestPatternConfig {
    #[derivative(Default(value = "vec![
        PatternDevice::new(\"0\", Facing::Back, 90),
        PatternDevice::new(\"1\", Facing::Front, 270),
    ]"))]
    pub devices: Vec<PatternDevice>,

    /// Reject every `configure` call, as a device refusing parameters would.
    pub reject_configuration: bool,

    /// Overrides the frame interval derived from the negotiated fps range.
    #[setters(strip_option)]
    pub frame_interval: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    open: AtomicUsize,
    max_open: AtomicUsize,
    opened_total: AtomicUsize,
    frames: AtomicUsize,
}

/// A backend producing moving gradients. Clones share device bookkeeping,
/// so a test can keep one to watch what the capture source does.
#[derive(Debug, Clone)]
pub struct TestPatternBackend {
    config: TestPatternConfig,
    counters: Arc<Counters>,
}

impl TestPatternBackend {
    pub fn new(config: TestPatternConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Devices currently open.
    pub fn open_devices(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Most devices ever open at the same time.
    pub fn max_open_devices(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.counters.opened_total.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> usize {
        self.counters.frames.load(Ordering::SeqCst)
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new(TestPatternConfig::default())
    }
}

impl CameraBackend for TestPatternBackend {
    fn list_cameras(&mut self) -> CameraResult<Vec<CameraInfo>> {
        Ok(self.config.devices.iter().map(|d| d.info.clone()).collect())
    }

    fn open(&mut self, camera: &CameraInfo) -> CameraResult<Box<dyn CameraDevice>> {
        let device = self
            .config
            .devices
            .iter()
            .find(|d| d.info.id == camera.id)
            .ok_or_else(|| CameraError::DeviceUnavailable(camera.id.clone()))?;

        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(open, Ordering::SeqCst);
        self.counters.opened_total.fetch_add(1, Ordering::SeqCst);
        log::debug!("open test pattern camera {}", camera.id);

        Ok(Box::new(PatternCamera {
            device: device.clone(),
            reject_configuration: self.config.reject_configuration,
            frame_interval: self.config.frame_interval,
            params: None,
            counters: self.counters.clone(),
            stop_sig: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct PatternCamera {
    device: PatternDevice,
    reject_configuration: bool,
    frame_interval: Option<Duration>,
    params: Option<PreviewParams>,
    counters: Arc<Counters>,
    stop_sig: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CameraDevice for PatternCamera {
    fn info(&self) -> &CameraInfo {
        &self.device.info
    }

    fn capabilities(&mut self) -> CameraResult<DeviceCapabilities> {
        Ok(self.device.capabilities.clone())
    }

    fn configure(&mut self, params: &PreviewParams) -> CameraResult<PreviewParams> {
        if self.reject_configuration {
            return Err(CameraError::ConfigurationError(format!(
                "{} rejected {}x{}",
                self.device.info.id, params.size.width, params.size.height
            )));
        }

        let caps = &self.device.capabilities;
        if !caps.preview_sizes.contains(&params.size) && params.size != caps.default_size {
            return Err(CameraError::ConfigurationError(format!(
                "unsupported preview size {}x{}",
                params.size.width, params.size.height
            )));
        }

        self.params = Some(params.clone());
        Ok(params.clone())
    }

    fn start_preview(&mut self, output: FrameProducer) -> CameraResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let params = self
            .params
            .clone()
            .ok_or_else(|| CameraError::ConfigurationError("device not configured".to_string()))?;

        let interval = self.frame_interval.unwrap_or_else(|| {
            Duration::from_micros(1_000_000_000 / u64::from(params.fps_range.max.max(1000)))
        });

        self.stop_sig.store(false, Ordering::SeqCst);
        let stop_sig = self.stop_sig.clone();
        let counters = self.counters.clone();
        let PreviewSize { width, height } = params.size;

        self.worker = Some(thread::spawn(move || {
            let mut index = 0u32;
            while !stop_sig.load(Ordering::SeqCst) {
                if !output.queue_frame(pattern_frame(width, height, index)) {
                    break;
                }
                counters.frames.fetch_add(1, Ordering::SeqCst);
                index = index.wrapping_add(1);
                thread::sleep(interval);
            }
        }));

        Ok(())
    }

    fn stop_preview(&mut self) {
        self.stop_sig.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            log::warn!("test pattern worker of {} panicked", self.device.info.id);
        }
    }
}

impl Drop for PatternCamera {
    fn drop(&mut self) {
        self.stop_preview();
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        log::debug!("release test pattern camera {}", self.device.info.id);
    }
}

/// A diagonal gradient that shifts with `index`.
pub fn pattern_frame(width: u32, height: u32, index: u32) -> RgbaImage {
    let shift = (index % 256) as u8;
    RgbaImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        Rgba([r, g, shift, 255])
    })
}
