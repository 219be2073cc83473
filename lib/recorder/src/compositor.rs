use crate::Result;
use gpu_surface::{
    FrameProducer, GpuContext, GpuError, Mat4, SharedContext, SurfaceTexture, TextureDrawer,
    TextureId, gles,
};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

/// Yellow, so the area outside the drawn quad is easy to spot.
const CLEAR_COLOR: [u8; 4] = [255, 255, 0, 255];

/// Receives the camera texture on every nth display draw.
pub trait FrameConsumer: Send + Sync {
    /// Binds the consumer to the share group that owns `texture`. Called on
    /// the display render thread; returns once the consumer can draw it.
    fn bind(&self, share: &SharedContext, texture: TextureId) -> Result<()>;

    /// A new frame landed in `texture`. Must not block.
    fn frame_available(&self, texture: TextureId, tex_matrix: &Mat4);
}

/// The consumer currently attached to a compositor. Attach and detach go
/// through the same lock the draw path takes to notify the consumer.
pub type ConsumerSlot = Arc<Mutex<Option<Arc<dyn FrameConsumer>>>>;

/// Scale factor that makes `video` cover `view` with cropping.
pub fn aspect_fit_scale(view: (u32, u32), video: (u32, u32)) -> Option<f64> {
    let (vw, vh) = view;
    let (ww, wh) = video;
    if vw == 0 || vh == 0 || ww == 0 || wh == 0 {
        return None;
    }

    Some((vw as f64 / ww as f64).max(vh as f64 / wh as f64))
}

/// Model-view-projection matrix of the aspect-fit quad, optionally mirrored
/// horizontally. `None` while either size is still unknown.
pub fn aspect_fit_matrix(view: (u32, u32), video: (u32, u32), mirror: bool) -> Option<Mat4> {
    let scale = aspect_fit_scale(view, video)?;
    let width = scale * video.0 as f64;
    let height = scale * video.1 as f64;

    let sx = (width / view.0 as f64) as f32;
    let sy = (height / view.1 as f64) as f32;
    log::debug!(
        "view({},{}) video({},{}) size({width:.0},{height:.0}) mat({sx},{sy})",
        view.0,
        view.1,
        video.0,
        video.1
    );

    Some(Mat4::scale(if mirror { -sx } else { sx }, sy, 1.0))
}

/// Draws the camera texture on the display surface and hands every nth
/// frame to an attached [`FrameConsumer`].
///
/// Lives on the display render thread; every method expects the display
/// context to be current there.
pub struct FrameCompositor {
    texture: Option<SurfaceTexture>,
    drawer: Option<TextureDrawer>,
    share: Option<SharedContext>,
    tex_matrix: Mat4,
    mvp: Mat4,
    pending_update: Arc<AtomicBool>,
    redraw: Arc<dyn Fn() + Send + Sync>,
    view_size: (u32, u32),
    video_size: (u32, u32),
    encode_interval: u32,
    draw_count: u64,
    consumer: ConsumerSlot,
}

impl FrameCompositor {
    /// `redraw` is invoked from the producer's thread whenever a camera
    /// frame arrives.
    pub fn new(encode_every_nth_draw: u32, redraw: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            texture: None,
            drawer: None,
            share: None,
            tex_matrix: Mat4::identity(),
            mvp: Mat4::identity(),
            pending_update: Arc::new(AtomicBool::new(false)),
            redraw: Arc::new(redraw),
            view_size: (0, 0),
            video_size: (0, 0),
            encode_interval: encode_every_nth_draw.max(1),
            draw_count: 0,
            consumer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn consumer_slot(&self) -> ConsumerSlot {
        self.consumer.clone()
    }

    pub fn on_surface_created(&mut self, context: &GpuContext) -> Result<()> {
        if let Err(e) = context.check_frame_format() {
            log::warn!("This system can't sample camera frames: {e}");
            return Err(e.into());
        }

        let texture_id = context.gen_texture()?;
        let texture = SurfaceTexture::new(context, texture_id)?;

        let pending = self.pending_update.clone();
        let redraw = self.redraw.clone();
        texture.set_on_frame_available(move || {
            pending.store(true, Ordering::Release);
            redraw();
        });

        gles::clear_color(CLEAR_COLOR)?;

        let mut drawer = TextureDrawer::new(context)?;
        drawer.set_matrix(self.mvp);

        log::debug!("compositor texture {}", texture_id.raw());
        self.texture = Some(texture);
        self.drawer = Some(drawer);
        self.share = Some(context.share_handle());
        Ok(())
    }

    /// Zero sizes mean the view is still being laid out and are ignored.
    pub fn on_surface_changed(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.view_size = (width, height);
        self.update_viewport()
    }

    pub fn set_video_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.video_size = (width, height);
        self.update_viewport()
    }

    pub fn update_viewport(&mut self) -> Result<()> {
        let (width, height) = self.view_size;
        if width == 0 || height == 0 {
            return Ok(());
        }

        gles::viewport(0, 0, width, height)?;
        gles::clear()?;

        let Some(mvp) = aspect_fit_matrix(self.view_size, self.video_size, false) else {
            return Ok(());
        };

        self.mvp = mvp;
        if let Some(drawer) = self.drawer.as_mut() {
            drawer.set_matrix(mvp);
        }
        Ok(())
    }

    /// Draws one display frame. The caller presents the surface afterwards.
    pub fn on_draw_frame(&mut self) -> Result<()> {
        let (Some(texture), Some(drawer)) = (self.texture.as_mut(), self.drawer.as_ref()) else {
            return Ok(());
        };

        gles::clear()?;

        if self.pending_update.swap(false, Ordering::AcqRel) {
            texture.update_tex_image()?;
            self.tex_matrix = texture.transform_matrix();
        }

        let texture_id = texture.texture_id();
        drawer.draw(texture_id, &self.tex_matrix)?;

        self.draw_count += 1;
        if self.draw_count % self.encode_interval as u64 == 0 {
            let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(consumer) = consumer.as_ref() {
                consumer.frame_available(texture_id, &self.tex_matrix);
            }
        }

        Ok(())
    }

    /// Binds `consumer` to this compositor's texture and starts forwarding
    /// frames to it.
    pub fn attach_consumer(&mut self, consumer: Arc<dyn FrameConsumer>) -> Result<()> {
        let (Some(share), Some(texture)) = (self.share.as_ref(), self.texture_id()) else {
            return Err(GpuError::NotCurrent.into());
        };

        let mut slot = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        consumer.bind(share, texture)?;
        *slot = Some(consumer);
        Ok(())
    }

    pub fn detach_consumer(&self) {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn frame_producer(&self) -> Option<FrameProducer> {
        self.texture.as_ref().map(|t| t.producer())
    }

    pub fn texture_id(&self) -> Option<TextureId> {
        self.texture.as_ref().map(|t| t.texture_id())
    }

    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn mvp(&self) -> Mat4 {
        self.mvp
    }

    /// Releases the texture, its image stream and the drawer, in that order.
    pub fn on_surface_destroyed(&mut self, context: &GpuContext) {
        if let Some(texture) = self.texture.take() {
            context.delete_texture(texture.texture_id());
            texture.release();
        }

        if let Some(mut drawer) = self.drawer.take() {
            drawer.release();
        }

        self.share = None;
        self.pending_update.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_surface::{ContextConfig, EglSurface, MemoryWindow, Platform, Rgba, RgbaImage};
    use std::sync::atomic::AtomicUsize;

    struct CountingConsumer {
        frames: AtomicUsize,
        bound: AtomicUsize,
    }

    impl FrameConsumer for CountingConsumer {
        fn bind(&self, _share: &SharedContext, _texture: TextureId) -> Result<()> {
            self.bound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn frame_available(&self, _texture: TextureId, _tex_matrix: &Mat4) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn display_on(
        platform: &Platform,
        width: u32,
        height: u32,
    ) -> Option<(GpuContext, EglSurface)> {
        let ctx = match GpuContext::new(platform, None, ContextConfig::default()) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("Skipping test (no GPU): {e}");
                return None;
            }
        };
        let surface = ctx
            .create_window_surface(Arc::new(MemoryWindow::new(width, height)))
            .unwrap();
        surface.make_current().unwrap();
        Some((ctx, surface))
    }

    fn display(width: u32, height: u32) -> Option<(GpuContext, EglSurface)> {
        display_on(&Platform::default(), width, height)
    }

    #[test]
    fn test_aspect_fit_covers_view() {
        let cases = [
            ((1080, 1920), (720, 1280)),
            ((1920, 1080), (480, 640)),
            ((100, 100), (320, 180)),
            ((64, 36), (36, 64)),
        ];

        for (view, video) in cases {
            let scale = aspect_fit_scale(view, video).unwrap();
            let expected = (view.0 as f64 / video.0 as f64).max(view.1 as f64 / video.1 as f64);
            assert_eq!(scale, expected);
            assert!(scale * video.0 as f64 >= view.0 as f64 - 1e-9);
            assert!(scale * video.1 as f64 >= view.1 as f64 - 1e-9);

            let m = aspect_fit_matrix(view, video, false).unwrap();
            assert!(m.0[0] >= 1.0 - 1e-6 && m.0[5] >= 1.0 - 1e-6);
        }

        assert_eq!(aspect_fit_scale((100, 100), (0, 0)), None);
        let mirrored = aspect_fit_matrix((100, 100), (100, 50), true).unwrap();
        assert_eq!(mirrored.0[0], -2.0);
        assert_eq!(mirrored.0[5], 1.0);
    }

    #[test]
    fn test_unsupported_platform() {
        let platform =
            Platform::default().with_frame_format(gpu_surface::wgpu::TextureFormat::R32Uint);
        let Some((ctx, _surface)) = display_on(&platform, 4, 4) else {
            return;
        };

        let mut compositor = FrameCompositor::new(2, || {});
        assert!(matches!(
            compositor.on_surface_created(&ctx),
            Err(crate::RecorderError::Gpu(GpuError::UnsupportedPlatform(_)))
        ));
        assert!(compositor.frame_producer().is_none());
    }

    #[test]
    fn test_zero_video_size_keeps_matrix() {
        let Some((ctx, _surface)) = display(8, 8) else {
            return;
        };
        let mut compositor = FrameCompositor::new(2, || {});
        compositor.on_surface_created(&ctx).unwrap();
        compositor.on_surface_changed(8, 8).unwrap();

        compositor.set_video_size(0, 0).unwrap();
        assert_eq!(compositor.mvp(), Mat4::identity());

        compositor.set_video_size(8, 4).unwrap();
        assert_eq!(compositor.mvp(), Mat4::scale(2.0, 1.0, 1.0));

        compositor.set_video_size(0, 4).unwrap();
        assert_eq!(compositor.mvp(), Mat4::scale(2.0, 1.0, 1.0));
    }

    #[test]
    fn test_forwards_every_nth_draw() {
        let Some((ctx, surface)) = display(4, 4) else {
            return;
        };
        let redraws = Arc::new(AtomicUsize::new(0));
        let counter = redraws.clone();
        let mut compositor = FrameCompositor::new(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        compositor.on_surface_created(&ctx).unwrap();
        compositor.on_surface_changed(4, 4).unwrap();
        compositor.set_video_size(4, 4).unwrap();

        let consumer = Arc::new(CountingConsumer {
            frames: AtomicUsize::new(0),
            bound: AtomicUsize::new(0),
        });
        compositor.attach_consumer(consumer.clone()).unwrap();
        assert_eq!(consumer.bound.load(Ordering::SeqCst), 1);

        let producer = compositor.frame_producer().unwrap();
        producer.queue_frame(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])));
        assert_eq!(redraws.load(Ordering::SeqCst), 1);

        for _ in 0..6 {
            compositor.on_draw_frame().unwrap();
        }
        assert_eq!(compositor.draw_count(), 6);
        assert_eq!(consumer.frames.load(Ordering::SeqCst), 3);
        assert_eq!(*surface.read_pixels().unwrap().get_pixel(0, 0), Rgba([0, 0, 255, 255]));

        compositor.detach_consumer();
        compositor.on_draw_frame().unwrap();
        compositor.on_draw_frame().unwrap();
        assert_eq!(consumer.frames.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_every_draw_when_interval_is_one() {
        let Some((ctx, _surface)) = display(4, 4) else {
            return;
        };
        let mut compositor = FrameCompositor::new(0, || {});
        compositor.on_surface_created(&ctx).unwrap();

        let consumer = Arc::new(CountingConsumer {
            frames: AtomicUsize::new(0),
            bound: AtomicUsize::new(0),
        });
        compositor.attach_consumer(consumer.clone()).unwrap();

        for _ in 0..3 {
            compositor.on_draw_frame().unwrap();
        }
        assert_eq!(consumer.frames.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_surface_destroyed_twice() {
        let Some((ctx, _surface)) = display(4, 4) else {
            return;
        };
        let mut compositor = FrameCompositor::new(2, || {});
        compositor.on_surface_created(&ctx).unwrap();
        let texture = compositor.texture_id().unwrap();
        let producer = compositor.frame_producer().unwrap();

        compositor.on_surface_destroyed(&ctx);
        compositor.on_surface_destroyed(&ctx);
        assert!(!ctx.has_texture(texture));
        assert!(producer.is_released());
        assert!(compositor.texture_id().is_none());
        assert!(compositor.on_draw_frame().is_ok());
    }
}
