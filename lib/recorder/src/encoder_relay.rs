use crate::{Result, compositor::aspect_fit_matrix};
use gpu_surface::{
    ContextConfig, EglSurface, GpuContext, GpuError, Mat4, NativeWindow, SharedContext,
    TextureDrawer, TextureId, gles,
};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle, ThreadId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Prepared,
    /// Release was requested; the loop is tearing down.
    Draining,
    Released,
}

struct ContextRequest {
    share: SharedContext,
    texture: TextureId,
    window: Arc<dyn NativeWindow>,
    recordable: bool,
    ticket: u64,
}

struct Pending {
    state: RelayState,
    running: bool,
    finished: bool,
    context_request: Option<ContextRequest>,
    next_ticket: u64,
    applied_ticket: u64,
    applied_error: Option<GpuError>,
    draw_owed: bool,
    texture: Option<TextureId>,
    tex_matrix: Mat4,
    release_requested: bool,
    window: Option<Arc<dyn NativeWindow>>,
    surface_valid: bool,
    drawn: u64,
}

struct Shared {
    pending: Mutex<Pending>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Pending>) -> MutexGuard<'a, Pending> {
        self.signal
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Redraws the shared camera texture onto the encoder's input surface from
/// a thread of its own, so a slow encoder never stalls the display.
///
/// Every method posts a request to that thread. Draw requests are coalesced:
/// however many are posted, the loop owes at most one redraw with the latest
/// texture and matrix.
///
/// The relay thread owns its own context, created in the share group of the
/// display context handed to [`set_context`](Self::set_context). The camera
/// texture is therefore visible on both threads while each context stays
/// current on exactly one of them. Calling `set_context` again swaps the
/// context and surface, for example after the codec recreated its input
/// window; the old pair is released on the relay thread first.
///
/// Frames come out oriented like the preview. Front-facing cameras are
/// flipped horizontally, and a video whose aspect ratio differs from the
/// encoder surface is letterboxed.
///
/// [`release`](Self::release) stops drawing, frees the GPU objects and joins
/// the thread. Dropping the relay does the same.
///
/// # Examples
/// ```no_run
/// use gpu_surface::{ContextConfig, GpuContext, Mat4, MemoryWindow, Platform};
/// use recorder::EncoderFrameRelay;
/// use std::sync::Arc;
///
/// fn main() -> recorder::Result<()> {
///     let display = GpuContext::new(&Platform::default(), None, ContextConfig::default())?;
///     let camera_texture = display.gen_texture()?;
///
///     let relay = EncoderFrameRelay::new("h264", (1280, 720), false)?;
///     let encoder_input = Arc::new(MemoryWindow::new(1280, 720));
///     relay.set_context(&display.share_handle(), camera_texture, encoder_input, true)?;
///
///     // called from the display thread after every preview draw
///     relay.draw(camera_texture, &Mat4::identity());
///
///     relay.release();
///     Ok(())
/// }
/// ```
pub struct EncoderFrameRelay {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Option<ThreadId>,
}

impl EncoderFrameRelay {
    /// `video_size` is the upright camera size used for the aspect-fit
    /// transform; `front_facing` mirrors the output horizontally.
    pub fn new(name: &str, video_size: (u32, u32), front_facing: bool) -> Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                state: RelayState::Idle,
                running: false,
                finished: false,
                context_request: None,
                next_ticket: 0,
                applied_ticket: 0,
                applied_error: None,
                draw_owed: false,
                texture: None,
                tex_matrix: Mat4::identity(),
                release_requested: false,
                window: None,
                surface_valid: false,
                drawn: 0,
            }),
            signal: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}-relay"))
            .spawn(move || {
                RelayLoop {
                    shared: worker_shared,
                    video_size,
                    mirror: front_facing,
                    gpu: RelayGpu::default(),
                }
                .run()
            })?;

        let worker_id = handle.thread().id();

        let mut pending = shared.lock();
        while !pending.running && !pending.finished {
            pending = shared.wait(pending);
        }
        drop(pending);

        log::debug!("{name} relay started, video size {video_size:?}, mirror {front_facing}");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id: Some(worker_id),
        })
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_id == Some(thread::current().id())
    }

    /// Replaces the context/surface pair with one that shares `share` and
    /// renders into `window`. Returns once the new context is current on
    /// the relay thread, or with the error that prevented it.
    pub fn set_context(
        &self,
        share: &SharedContext,
        texture: TextureId,
        window: Arc<dyn NativeWindow>,
        recordable: bool,
    ) -> Result<()> {
        let mut pending = self.shared.lock();
        if pending.release_requested || pending.finished {
            return Err(GpuError::Released.into());
        }

        pending.next_ticket += 1;
        let ticket = pending.next_ticket;
        pending.context_request = Some(ContextRequest {
            share: share.clone(),
            texture,
            window,
            recordable,
            ticket,
        });
        self.shared.signal.notify_all();

        if self.on_worker_thread() {
            return Ok(());
        }

        while pending.applied_ticket < ticket && !pending.finished {
            pending = self.shared.wait(pending);
        }

        if pending.applied_ticket < ticket {
            return Err(GpuError::Released.into());
        }

        match pending.applied_error.as_ref() {
            Some(e) if pending.applied_ticket == ticket => Err(e.clone().into()),
            // superseded by a newer context
            _ => Ok(()),
        }
    }

    /// Asks for a redraw of `texture`. Never blocks on the relay thread.
    /// Returns `false` once the relay is released.
    pub fn draw(&self, texture: TextureId, tex_matrix: &Mat4) -> bool {
        let mut pending = self.shared.lock();
        if pending.release_requested || pending.finished {
            return false;
        }

        pending.texture = Some(texture);
        pending.tex_matrix = *tex_matrix;
        pending.draw_owed = true;
        self.shared.signal.notify_all();
        true
    }

    /// Whether the bound encoder surface can still take frames.
    pub fn is_valid(&self) -> bool {
        let pending = self.shared.lock();
        pending.surface_valid && pending.window.as_ref().is_some_and(|w| w.is_valid())
    }

    pub fn state(&self) -> RelayState {
        self.shared.lock().state
    }

    /// Frames drawn and presented to the encoder surface so far.
    pub fn frames_drawn(&self) -> u64 {
        self.shared.lock().drawn
    }

    /// Releases the drawer, the surface and the context, then stops the
    /// relay thread. Blocks until that is done; repeated calls are no-ops.
    pub fn release(&self) {
        {
            let mut pending = self.shared.lock();
            if !pending.finished {
                pending.release_requested = true;
                if pending.state != RelayState::Released {
                    pending.state = RelayState::Draining;
                }
                self.shared.signal.notify_all();
            }

            if self.on_worker_thread() {
                return;
            }

            while !pending.finished {
                pending = self.shared.wait(pending);
            }
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::warn!("encoder relay thread panicked");
        }
    }
}

impl Drop for EncoderFrameRelay {
    fn drop(&mut self) {
        self.release();
    }
}

enum Work {
    SetContext(ContextRequest),
    Draw(Option<TextureId>, Mat4),
    Exit,
}

struct RelayLoop {
    shared: Arc<Shared>,
    video_size: (u32, u32),
    mirror: bool,
    gpu: RelayGpu,
}

impl RelayLoop {
    fn run(mut self) {
        {
            let mut pending = self.shared.lock();
            pending.running = true;
            self.shared.signal.notify_all();
        }

        loop {
            match self.next_work() {
                Work::Exit => break,
                Work::SetContext(request) => self.apply_context(request),
                Work::Draw(texture, tex_matrix) => self.draw(texture, &tex_matrix),
            }
        }

        self.gpu.release();

        let mut pending = self.shared.lock();
        pending.state = RelayState::Released;
        pending.surface_valid = false;
        pending.window = None;
        pending.finished = true;
        pending.running = false;
        self.shared.signal.notify_all();
        log::debug!("encoder relay exit, {} frames drawn", pending.drawn);
    }

    fn next_work(&self) -> Work {
        let mut pending = self.shared.lock();
        loop {
            if pending.release_requested {
                return Work::Exit;
            }

            if let Some(request) = pending.context_request.take() {
                return Work::SetContext(request);
            }

            if pending.draw_owed {
                pending.draw_owed = false;
                return Work::Draw(pending.texture, pending.tex_matrix);
            }

            pending = self.shared.wait(pending);
        }
    }

    fn apply_context(&mut self, request: ContextRequest) {
        let ticket = request.ticket;
        let window = request.window.clone();
        let result = self.gpu.prepare(request, self.video_size, self.mirror);

        if let Err(ref e) = result {
            log::warn!("encoder relay set context failed: {e}");
            self.gpu.release();
        }

        let mut pending = self.shared.lock();
        pending.state = match (&result, pending.state) {
            (_, RelayState::Draining) => RelayState::Draining,
            (Ok(_), _) => RelayState::Prepared,
            (Err(_), _) => RelayState::Idle,
        };
        pending.surface_valid = self.gpu.is_valid();
        pending.window = result.is_ok().then_some(window);
        pending.applied_ticket = ticket;
        pending.applied_error = result.err();
        self.shared.signal.notify_all();
    }

    fn draw(&mut self, texture: Option<TextureId>, tex_matrix: &Mat4) {
        let Some(texture) = texture else {
            return;
        };

        if !self.gpu.is_prepared() {
            log::trace!("encoder relay draw before context is set");
            return;
        }

        let result = self.gpu.draw(texture, tex_matrix);
        if let Err(ref e) = result {
            log::debug!("encoder relay draw failed: {e}");
        }

        let mut pending = self.shared.lock();
        pending.surface_valid = self.gpu.is_valid();
        if result.is_ok() {
            pending.drawn += 1;
        }
    }
}

#[derive(Default)]
struct RelayGpu {
    context: Option<GpuContext>,
    surface: Option<EglSurface>,
    drawer: Option<TextureDrawer>,
}

impl RelayGpu {
    fn prepare(
        &mut self,
        request: ContextRequest,
        video_size: (u32, u32),
        mirror: bool,
    ) -> gpu_surface::Result<()> {
        self.release();

        let context = GpuContext::new(
            request.share.platform(),
            Some(&request.share),
            ContextConfig {
                recordable: request.recordable,
            },
        )?;
        let surface = context.create_window_surface(request.window)?;
        surface.make_current()?;

        let mut drawer = TextureDrawer::new(&context)?;
        let (width, height) = surface.size();
        gles::viewport(0, 0, width, height)?;
        if let Some(mvp) = aspect_fit_matrix((width, height), video_size, mirror) {
            drawer.set_matrix(mvp);
        }

        log::debug!(
            "encoder relay context {} bound to texture {}, surface {width}x{height}",
            context.id(),
            request.texture.raw()
        );

        self.context = Some(context);
        self.surface = Some(surface);
        self.drawer = Some(drawer);
        Ok(())
    }

    fn is_prepared(&self) -> bool {
        self.context.is_some() && self.surface.is_some() && self.drawer.is_some()
    }

    fn is_valid(&self) -> bool {
        self.surface.as_ref().is_some_and(|s| s.is_valid())
    }

    fn draw(&self, texture: TextureId, tex_matrix: &Mat4) -> gpu_surface::Result<()> {
        let (Some(surface), Some(drawer)) = (self.surface.as_ref(), self.drawer.as_ref()) else {
            return Err(GpuError::NotCurrent);
        };

        surface.make_current()?;
        gles::clear()?;
        drawer.draw(texture, tex_matrix)?;
        surface.swap()
    }

    fn release(&mut self) {
        if let Some(mut drawer) = self.drawer.take() {
            drawer.release();
        }

        if let Some(surface) = self.surface.take() {
            surface.release();
        }

        if let Some(context) = self.context.take() {
            context.release_current();
            context.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_surface::{MemoryWindow, Platform, Rgba, RgbaImage, SurfaceTexture};
    use std::time::{Duration, Instant};

    struct Display {
        ctx: GpuContext,
        _surface: EglSurface,
        texture: SurfaceTexture,
    }

    fn display_with_frame(frame: RgbaImage) -> Option<Display> {
        let ctx = match GpuContext::new(&Platform::default(), None, ContextConfig::default()) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("Skipping test (no GPU): {e}");
                return None;
            }
        };
        let surface = ctx
            .create_window_surface(Arc::new(MemoryWindow::new(4, 4)))
            .unwrap();
        surface.make_current().unwrap();

        let id = ctx.gen_texture().unwrap();
        let mut texture = SurfaceTexture::new(&ctx, id).unwrap();
        texture.producer().queue_frame(frame);
        assert!(texture.update_tex_image().unwrap());

        Some(Display {
            ctx,
            _surface: surface,
            texture,
        })
    }

    fn wait_presented(window: &MemoryWindow, count: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if window.presented_count() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_draw_reaches_encoder_surface() {
        _ = env_logger::builder().is_test(true).try_init();

        let frame = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        let Some(display) = display_with_frame(frame) else {
            return;
        };
        let relay = EncoderFrameRelay::new("test", (4, 4), false).unwrap();
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(!relay.is_valid());

        let window = Arc::new(MemoryWindow::new(4, 4));
        relay
            .set_context(
                &display.ctx.share_handle(),
                display.texture.texture_id(),
                window.clone(),
                true,
            )
            .unwrap();
        assert_eq!(relay.state(), RelayState::Prepared);
        assert!(relay.is_valid());

        assert!(relay.draw(display.texture.texture_id(), &Mat4::identity()));
        assert!(wait_presented(&window, 1));

        let frame = window.last_frame().unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*frame.get_pixel(3, 3), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_front_facing_is_mirrored() {
        let mut frame = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        for y in 0..4 {
            for x in 2..4 {
                frame.put_pixel(x, y, Rgba([0, 0, 255, 255]));
            }
        }

        let Some(display) = display_with_frame(frame) else {
            return;
        };
        let relay = EncoderFrameRelay::new("mirror", (4, 4), true).unwrap();
        let window = Arc::new(MemoryWindow::new(4, 4));
        relay
            .set_context(
                &display.ctx.share_handle(),
                display.texture.texture_id(),
                window.clone(),
                true,
            )
            .unwrap();

        relay.draw(display.texture.texture_id(), &Mat4::identity());
        assert!(wait_presented(&window, 1));

        let frame = window.last_frame().unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        assert_eq!(*frame.get_pixel(3, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_draws_are_coalesced() {
        let frame = RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 255]));
        let Some(display) = display_with_frame(frame) else {
            return;
        };
        let relay = EncoderFrameRelay::new("coalesce", (4, 4), false).unwrap();
        let window = Arc::new(MemoryWindow::new(4, 4));
        relay
            .set_context(
                &display.ctx.share_handle(),
                display.texture.texture_id(),
                window.clone(),
                true,
            )
            .unwrap();

        for _ in 0..50 {
            relay.draw(display.texture.texture_id(), &Mat4::identity());
        }
        assert!(wait_presented(&window, 1));

        relay.release();
        let drawn = relay.frames_drawn();
        assert!((1..=50).contains(&drawn));
        assert_eq!(window.presented_count(), drawn);
    }

    #[test]
    fn test_set_context_failure_is_reported() {
        let Some(display) = display_with_frame(RgbaImage::new(4, 4)) else {
            return;
        };
        let relay = EncoderFrameRelay::new("invalid", (4, 4), false).unwrap();

        let window = Arc::new(MemoryWindow::new(4, 4));
        window.invalidate();
        let result = relay.set_context(
            &display.ctx.share_handle(),
            display.texture.texture_id(),
            window,
            true,
        );
        assert!(matches!(
            result,
            Err(crate::RecorderError::Gpu(GpuError::SurfaceInvalid))
        ));
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(!relay.is_valid());
    }

    #[test]
    fn test_invalidated_window_is_not_valid() {
        let Some(display) = display_with_frame(RgbaImage::new(4, 4)) else {
            return;
        };
        let relay = EncoderFrameRelay::new("valid", (4, 4), false).unwrap();
        let window = Arc::new(MemoryWindow::new(4, 4));
        relay
            .set_context(
                &display.ctx.share_handle(),
                display.texture.texture_id(),
                window.clone(),
                true,
            )
            .unwrap();
        assert!(relay.is_valid());

        window.invalidate();
        assert!(!relay.is_valid());
    }

    #[test]
    fn test_release_is_idempotent() {
        let Some(display) = display_with_frame(RgbaImage::new(4, 4)) else {
            return;
        };
        let relay = EncoderFrameRelay::new("release", (4, 4), false).unwrap();
        relay
            .set_context(
                &display.ctx.share_handle(),
                display.texture.texture_id(),
                Arc::new(MemoryWindow::new(4, 4)),
                true,
            )
            .unwrap();

        relay.release();
        relay.release();
        assert_eq!(relay.state(), RelayState::Released);
        assert!(!relay.is_valid());
        assert!(!relay.draw(display.texture.texture_id(), &Mat4::identity()));
        assert!(
            relay
                .set_context(
                    &display.ctx.share_handle(),
                    display.texture.texture_id(),
                    Arc::new(MemoryWindow::new(4, 4)),
                    true,
                )
                .is_err()
        );

        // the display's share group outlives the relay
        assert!(display.ctx.has_texture(display.texture.texture_id()));
    }
}
