use crate::{
    Result, VideoEncoder,
    media_encoder::{EncoderListener, EncoderRef},
    render_thread::DisplayRenderer,
};
use camera::{
    CameraBackend, CameraCaptureSource, CaptureConfig, CaptureSession, PreviewSize, PreviewTarget,
};
use gpu_surface::{FrameProducer, NativeWindow, Platform};
use std::sync::{
    Arc, Mutex, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

struct ViewInner {
    renderer: DisplayRenderer,
    producer: Mutex<Option<FrameProducer>>,
    view_size: Mutex<(u32, u32)>,
    session: Mutex<Option<CaptureSession>>,
    video_encoder: Mutex<Option<VideoEncoder>>,
    has_surface: AtomicBool,
}

impl ViewInner {
    fn set_video_encoder(&self, encoder: Option<VideoEncoder>) -> Result<()> {
        let mut current = self
            .video_encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match encoder {
            Some(encoder) => {
                self.renderer.attach_consumer(Arc::new(encoder.clone()))?;
                *current = Some(encoder);
            }
            None => {
                self.renderer.detach_consumer();
                *current = None;
            }
        }
        Ok(())
    }
}

impl PreviewTarget for ViewInner {
    fn frame_producer(&self) -> Option<FrameProducer> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_preview_configured(&self, session: &CaptureSession) {
        let size = session.video_size();
        log::debug!(
            "camera {} configured, video size {}x{}",
            session.camera_id,
            size.width,
            size.height
        );

        self.renderer.set_video_size(size.width, size.height);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
    }

    fn on_preview_stopped(&self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Attaches a prepared video encoder to the view and detaches it again once
/// it stops. Holds the view weakly; events after the view is gone are
/// ignored.
struct ViewEncoderListener {
    view: Weak<ViewInner>,
}

impl EncoderListener for ViewEncoderListener {
    fn on_prepared(&self, encoder: EncoderRef) {
        let EncoderRef::Video(encoder) = encoder else {
            return;
        };

        if let Some(view) = self.view.upgrade()
            && let Err(e) = view.set_video_encoder(Some(encoder))
        {
            log::warn!("attach video encoder failed: {e}");
        }
    }

    fn on_stopped(&self, encoder: EncoderRef) {
        if !matches!(encoder, EncoderRef::Video(_)) {
            return;
        }

        if let Some(view) = self.view.upgrade() {
            _ = view.set_video_encoder(None);
        }
    }
}

/// A camera preview that can also feed a video encoder.
///
/// Owns the camera worker and the display render thread, and forwards the
/// lifecycle of the platform surface to both.
pub struct CameraView {
    inner: Arc<ViewInner>,
    camera: CameraCaptureSource,
}

impl CameraView {
    pub fn new(
        platform: Platform,
        backend: Box<dyn CameraBackend>,
        config: CaptureConfig,
        encode_every_nth_draw: u32,
    ) -> Self {
        let inner = Arc::new(ViewInner {
            renderer: DisplayRenderer::new(platform, encode_every_nth_draw),
            producer: Mutex::new(None),
            view_size: Mutex::new((0, 0)),
            session: Mutex::new(None),
            video_encoder: Mutex::new(None),
            has_surface: AtomicBool::new(false),
        });

        let target: Weak<ViewInner> = Arc::downgrade(&inner);
        let target: Weak<dyn PreviewTarget> = target;
        let camera = CameraCaptureSource::new(backend, target, config);

        Self { inner, camera }
    }

    fn view_size(&self) -> (u32, u32) {
        *self
            .inner
            .view_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Restarts the preview when the surface is still around.
    pub fn on_resume(&self) -> Result<()> {
        let (width, height) = self.view_size();
        if self.inner.has_surface.load(Ordering::Acquire) && width > 0 && height > 0 {
            self.camera.start_preview(width, height)?;
        }
        Ok(())
    }

    pub fn on_pause(&self) {
        self.camera.stop_preview_async();
    }

    pub fn on_surface_created(&self, window: Arc<dyn NativeWindow>) -> Result<()> {
        let producer = self.inner.renderer.on_surface_created(window)?;
        *self
            .inner
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(producer);
        self.inner.has_surface.store(true, Ordering::Release);
        Ok(())
    }

    /// Starts the camera preview once the view has a size.
    pub fn on_surface_changed(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        log::debug!("surface changed: {width}x{height}");
        *self
            .inner
            .view_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (width, height);
        self.inner.renderer.on_surface_changed(width, height);

        self.camera.start_preview(width, height)?;
        Ok(())
    }

    /// Stops the camera, detaches any encoder and releases the display
    /// resources.
    pub fn on_surface_destroyed(&self) {
        self.inner.has_surface.store(false, Ordering::Release);
        self.camera.stop_preview();
        _ = self.inner.set_video_encoder(None);

        self.inner
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.renderer.on_surface_destroyed();
    }

    pub fn switch_camera(&self) -> Result<()> {
        self.camera.switch_facing()?;
        Ok(())
    }

    /// Takes effect on the next preview start.
    pub fn set_display_rotation(&self, degrees: u32) {
        self.camera.set_display_rotation(degrees);
    }

    /// Attaches `encoder` to the display pipeline, or detaches the current
    /// one with `None`.
    pub fn set_video_encoder(&self, encoder: Option<VideoEncoder>) -> Result<()> {
        self.inner.set_video_encoder(encoder)
    }

    pub fn has_video_encoder(&self) -> bool {
        self.inner.renderer.has_consumer()
    }

    /// A listener that calls [`Self::set_video_encoder`] on prepare and stop.
    pub fn encoder_listener(&self) -> Arc<dyn EncoderListener> {
        Arc::new(ViewEncoderListener {
            view: Arc::downgrade(&self.inner),
        })
    }

    /// Upright size of the camera frames, once a preview runs.
    pub fn video_size(&self) -> Option<PreviewSize> {
        self.camera.video_size()
    }

    pub fn is_front_facing(&self) -> bool {
        self.camera.is_front_facing()
    }

    pub fn session(&self) -> Option<CaptureSession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_previewing(&self) -> bool {
        self.camera.is_previewing()
    }

    /// Frames shown on the display surface so far.
    pub fn presented_frames(&self) -> u64 {
        self.inner.renderer.presented_frames()
    }
}

impl Drop for CameraView {
    fn drop(&mut self) {
        self.camera.shutdown();
        self.inner.renderer.shutdown();
    }
}
