use crate::{
    CameraError, CameraResult,
    backend::{CameraBackend, CameraDevice},
    camera_info::{Facing, FocusMode, PreviewParams, PreviewSize, has_few_cameras, select_camera},
    negotiation::{
        choose_fixed_fps, choose_focus_mode, optimal_preview_size, orientation_correction,
        rotated_size, widest_fps_range,
    },
};
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use derivative::Derivative;
use derive_setters::Setters;
use gpu_surface::{FrameProducer, Mat4};
use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    thread::{self, JoinHandle, ThreadId},
};

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct CaptureConfig {
    #[derivative(Default(value = "16.0 / 9.0"))]
    pub aspect_ratio: f64,

    #[setters(strip_option)]
    pub max_preview_height: Option<u32>,

    pub facing: Facing,

    /// Display rotation in degrees, one of 0, 90, 180, 270.
    pub display_rotation: u32,

    /// Desired fixed frame rate (fps x 1000). Without it the widest range is used.
    #[setters(strip_option)]
    pub fixed_fps: Option<u32>,
}

/// The live device state, one per capture source.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSession {
    pub camera_id: String,
    pub facing: Facing,
    pub preview_size: PreviewSize,
    /// Clockwise degrees applied to frames, one of 0, 90, 180, 270.
    pub orientation: u32,
    pub focus_mode: Option<FocusMode>,
    /// Expected frame rate (fps x 1000).
    pub fps: u32,
}

impl CaptureSession {
    /// Size of the upright image consumers see.
    pub fn video_size(&self) -> PreviewSize {
        rotated_size(self.preview_size, self.orientation)
    }

    pub fn is_front_facing(&self) -> bool {
        self.facing == Facing::Front
    }
}

/// The consumer of a preview, usually a view. The worker only keeps a weak
/// reference, and a request made after the target is gone does nothing.
pub trait PreviewTarget: Send + Sync {
    /// Where frames go. `None` while the target has no texture yet.
    fn frame_producer(&self) -> Option<FrameProducer>;

    /// Called on the camera worker once parameters are negotiated.
    fn on_preview_configured(&self, session: &CaptureSession);

    fn on_preview_stopped(&self) {}
}

enum Request {
    StartPreview {
        width: u32,
        height: u32,
        done: Sender<CameraResult<()>>,
    },
    StopPreview {
        done: Option<Sender<()>>,
    },
    SwitchFacing {
        done: Sender<CameraResult<()>>,
    },
    SetDisplayRotation(u32),
    Exit,
}

#[derive(Default)]
struct SharedState {
    session: Option<CaptureSession>,
    facing: Facing,
}

/// Owns a camera device through a dedicated worker thread. Every device
/// call is serialized through that thread's queue.
pub struct CameraCaptureSource {
    sender: Sender<Request>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Option<ThreadId>,
    state: Arc<Mutex<SharedState>>,
}

impl CameraCaptureSource {
    pub fn new(
        backend: Box<dyn CameraBackend>,
        target: Weak<dyn PreviewTarget>,
        config: CaptureConfig,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let state = Arc::new(Mutex::new(SharedState {
            session: None,
            facing: config.facing,
        }));

        let worker = CameraWorker {
            backend,
            device: None,
            target,
            config,
            state: state.clone(),
            last_request: None,
        };

        let handle = thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || worker.run(receiver));

        let (worker, worker_id) = match handle {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                log::error!("spawn camera worker failed: {e}");
                (None, None)
            }
        };

        Self {
            sender,
            worker: Mutex::new(worker),
            worker_id,
            state,
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_id == Some(thread::current().id())
    }

    /// Opens a device and starts pushing frames to the target. Blocks until
    /// the worker has applied the request.
    pub fn start_preview(&self, width: u32, height: u32) -> CameraResult<()> {
        if self.on_worker_thread() {
            return Err(CameraError::WorkerGone);
        }

        let (done, result) = bounded(1);
        self.sender
            .send(Request::StartPreview {
                width,
                height,
                done,
            })
            .map_err(|_| CameraError::WorkerGone)?;
        result.recv().map_err(|_| CameraError::WorkerGone)?
    }

    /// Releases the device. Calling it again, or after the worker exited, is a no-op.
    pub fn stop_preview(&self) {
        self.request_stop(true);
    }

    /// Queues a stop without waiting for it.
    pub fn stop_preview_async(&self) {
        self.request_stop(false);
    }

    fn request_stop(&self, wait: bool) {
        let wait = wait && !self.on_worker_thread();
        let (done, finished) = bounded(1);
        let request = Request::StopPreview {
            done: wait.then_some(done),
        };

        if self.sender.send(request).is_err() {
            return;
        }
        if wait {
            _ = finished.recv();
        }
    }

    /// Restarts the preview on the opposite facing. Does nothing unless there
    /// are several cameras and one of them faces front.
    pub fn switch_facing(&self) -> CameraResult<()> {
        if self.on_worker_thread() {
            return Err(CameraError::WorkerGone);
        }

        let (done, result) = bounded(1);
        self.sender
            .send(Request::SwitchFacing { done })
            .map_err(|_| CameraError::WorkerGone)?;
        result.recv().map_err(|_| CameraError::WorkerGone)?
    }

    /// Takes effect on the next preview start.
    pub fn set_display_rotation(&self, degrees: u32) {
        _ = self.sender.send(Request::SetDisplayRotation(degrees));
    }

    pub fn session(&self) -> Option<CaptureSession> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()
    }

    pub fn is_previewing(&self) -> bool {
        self.session().is_some()
    }

    pub fn facing(&self) -> Facing {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .facing
    }

    pub fn is_front_facing(&self) -> bool {
        self.facing() == Facing::Front
    }

    /// Negotiated upright size, `None` before the first preview starts.
    pub fn video_size(&self) -> Option<PreviewSize> {
        self.session().map(|s| s.video_size())
    }

    /// Stops the preview and joins the worker.
    pub fn shutdown(&self) {
        _ = self.sender.send(Request::Exit);

        if self.on_worker_thread() {
            return;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::warn!("camera worker panicked");
        }
    }
}

impl Drop for CameraCaptureSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CameraWorker {
    backend: Box<dyn CameraBackend>,
    device: Option<Box<dyn CameraDevice>>,
    target: Weak<dyn PreviewTarget>,
    config: CaptureConfig,
    state: Arc<Mutex<SharedState>>,
    last_request: Option<(u32, u32)>,
}

impl CameraWorker {
    fn run(mut self, receiver: Receiver<Request>) {
        log::debug!("camera worker start");

        while let Ok(request) = receiver.recv() {
            match request {
                Request::StartPreview {
                    width,
                    height,
                    done,
                } => {
                    let result = self.start_preview(width, height);
                    if let Err(ref e) = result {
                        log::warn!("start preview failed: {e}");
                    }
                    _ = done.send(result);
                }
                Request::StopPreview { done } => {
                    self.stop_preview();
                    if let Some(done) = done {
                        _ = done.send(());
                    }
                }
                Request::SwitchFacing { done } => {
                    _ = done.send(self.switch_facing());
                }
                Request::SetDisplayRotation(degrees) => {
                    self.config.display_rotation = degrees % 360;
                }
                Request::Exit => break,
            }
        }

        self.stop_preview();
        log::debug!("camera worker exit");
    }

    fn set_session(&self, session: Option<CaptureSession>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .session = session;
    }

    fn requested_facing(&self) -> Facing {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .facing
    }

    fn start_preview(&mut self, width: u32, height: u32) -> CameraResult<()> {
        let Some(target) = self.target.upgrade() else {
            log::debug!("preview target is gone, ignore start request");
            return Ok(());
        };

        self.last_request = Some((width, height));
        if self.device.is_some() {
            return Ok(());
        }

        let cameras = self.backend.list_cameras()?;
        let facing = self.requested_facing();
        let camera = select_camera(&cameras, facing)
            .ok_or_else(|| CameraError::DeviceUnavailable(format!("no {facing:?} camera")))?
            .clone();

        let mut device = self.backend.open(&camera)?;
        log::info!(
            "open camera {} ({:?}) for a {width}x{height} view",
            camera.id,
            camera.facing
        );

        // anything failing past this point releases the device
        match self.configure(device.as_mut(), target.as_ref()) {
            Ok(session) => {
                log::info!(
                    "preview {}x{} rotated {} at {} fps",
                    session.preview_size.width,
                    session.preview_size.height,
                    session.orientation,
                    session.fps / 1000
                );
                self.set_session(Some(session));
                self.device = Some(device);
                Ok(())
            }
            Err(e) => {
                device.stop_preview();
                drop(device);
                self.set_session(None);
                Err(match e {
                    CameraError::ConfigurationError(_) => e,
                    other => CameraError::ConfigurationError(other.to_string()),
                })
            }
        }
    }

    fn configure(
        &self,
        device: &mut dyn CameraDevice,
        target: &dyn PreviewTarget,
    ) -> CameraResult<CaptureSession> {
        let info = device.info().clone();
        let caps = device.capabilities()?;

        let focus_mode = choose_focus_mode(&caps.focus_modes);
        let (fps_range, fps) = match self.config.fixed_fps {
            Some(desired) => choose_fixed_fps(&caps.fps_ranges, caps.current_fps_range, desired),
            None => {
                let range = widest_fps_range(&caps.fps_ranges).unwrap_or(caps.current_fps_range);
                (range, range.max)
            }
        };
        log::debug!("fps range {}-{}", fps_range.min, fps_range.max);

        let size = optimal_preview_size(
            &caps.preview_sizes,
            self.config.aspect_ratio,
            self.config.max_preview_height,
        )
        .unwrap_or(caps.default_size);

        let orientation = orientation_correction(
            info.facing,
            info.sensor_orientation,
            self.config.display_rotation,
        );

        let applied = device.configure(&PreviewParams {
            size,
            fps_range,
            focus_mode,
            display_orientation: orientation,
            recording_hint: true,
        })?;

        let session = CaptureSession {
            camera_id: info.id,
            facing: info.facing,
            preview_size: applied.size,
            orientation: applied.display_orientation,
            focus_mode: applied.focus_mode,
            fps,
        };

        let producer = target.frame_producer().ok_or_else(|| {
            CameraError::ConfigurationError("preview target has no texture".to_string())
        })?;
        producer.set_default_buffer_size(applied.size.width, applied.size.height);
        producer.set_transform(Mat4::texture_rotation(session.orientation));

        target.on_preview_configured(&session);
        device.start_preview(producer)?;
        Ok(session)
    }

    fn stop_preview(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };

        log::info!("release camera {}", device.info().id);
        device.stop_preview();
        drop(device);
        self.set_session(None);

        if let Some(target) = self.target.upgrade() {
            target.on_preview_stopped();
        }
    }

    fn switch_facing(&mut self) -> CameraResult<()> {
        let cameras = self.backend.list_cameras()?;
        if !has_few_cameras(&cameras) {
            log::debug!("only one usable camera, ignore switch");
            return Ok(());
        }

        let facing = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.facing = state.facing.opposite();
            state.facing
        };
        log::info!("switch camera to {facing:?}");

        if self.device.is_none() {
            return Ok(());
        }

        self.stop_preview();
        match self.last_request {
            Some((width, height)) => self.start_preview(width, height),
            None => Ok(()),
        }
    }
}
