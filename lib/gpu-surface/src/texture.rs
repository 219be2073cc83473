use crate::{
    GpuContext, GpuError, Mat4, Result, TextureId,
    context::{ShareGroup, lock, with_current},
};
use image::{RgbaImage, imageops::FilterType};
use std::sync::{Arc, Mutex};

type FrameListener = Arc<dyn Fn() + Send + Sync>;

/// The texture a camera writes into, plus the transform that must be applied
/// when sampling it. Readers get copies; only the image stream updates it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedTexture {
    pub texture: TextureId,
    pub transform: Mat4,
}

struct StreamState {
    latest: Option<RgbaImage>,
    transform: Mat4,
    default_size: Option<(u32, u32)>,
    released: bool,
    queued: u64,
}

struct StreamInner {
    state: Mutex<StreamState>,
    listener: Mutex<Option<FrameListener>>,
}

/// A single-slot frame queue between a camera and whoever latches its frames.
///
/// Producers replace any frame that was not latched yet, so a slow reader
/// always sees the newest frame. The stream needs no GPU; a [`SurfaceTexture`]
/// wraps one and uploads latched frames into a texture.
#[derive(Clone)]
pub struct ImageStream {
    inner: Arc<StreamInner>,
}

impl Default for ImageStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    latest: None,
                    transform: Mat4::identity(),
                    default_size: None,
                    released: false,
                    queued: 0,
                }),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Called on the producer's thread every time a frame is queued.
    pub fn set_on_frame_available(&self, listener: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.listener) = Some(Arc::new(listener));
    }

    pub fn set_default_buffer_size(&self, width: u32, height: u32) {
        lock(&self.inner.state).default_size = Some((width, height));
    }

    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            stream: self.inner.clone(),
        }
    }

    /// Takes the newest queued frame and the transform it was queued with.
    pub fn latch(&self) -> Result<Option<(RgbaImage, Mat4)>> {
        let mut state = lock(&self.inner.state);
        if state.released {
            return Err(GpuError::Released);
        }

        let transform = state.transform;
        Ok(state.latest.take().map(|frame| (frame, transform)))
    }

    /// Number of frames queued since the stream was created.
    pub fn queued_frames(&self) -> u64 {
        lock(&self.inner.state).queued
    }

    pub fn is_released(&self) -> bool {
        lock(&self.inner.state).released
    }

    pub fn release(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.released {
                return;
            }
            state.released = true;
            state.latest = None;
        }
        lock(&self.inner.listener).take();
    }
}

/// Consumer end of an image stream. Frames queued by a [`FrameProducer`]
/// land in the texture on the next `update_tex_image`.
pub struct SurfaceTexture {
    texture: TextureId,
    group: Arc<ShareGroup>,
    stream: ImageStream,
    transform: Mat4,
}

impl SurfaceTexture {
    pub fn new(context: &GpuContext, texture: TextureId) -> Result<Self> {
        if !context.has_texture(texture) {
            return Err(GpuError::InvalidTexture(texture.raw()));
        }

        Ok(Self {
            texture,
            group: context.inner.group.clone(),
            stream: ImageStream::new(),
            transform: Mat4::identity(),
        })
    }

    pub fn texture_id(&self) -> TextureId {
        self.texture
    }

    pub fn stream(&self) -> &ImageStream {
        &self.stream
    }

    pub fn set_on_frame_available(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.stream.set_on_frame_available(listener);
    }

    pub fn set_default_buffer_size(&self, width: u32, height: u32) {
        self.stream.set_default_buffer_size(width, height);
    }

    pub fn producer(&self) -> FrameProducer {
        self.stream.producer()
    }

    /// Latches the newest queued frame into the texture. Must run with a
    /// context from the same share group current on this thread.
    /// Returns `false` when nothing new was queued.
    pub fn update_tex_image(&mut self) -> Result<bool> {
        with_current(|b| {
            if !Arc::ptr_eq(&b.context.group, &self.group) {
                return Err(GpuError::InvalidTexture(self.texture.raw()));
            }
            Ok(())
        })?;

        match self.stream.latch()? {
            Some((frame, transform)) => {
                self.group.upload(self.texture, &frame)?;
                self.transform = transform;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transform of the frame latched by the last `update_tex_image`.
    pub fn transform_matrix(&self) -> Mat4 {
        self.transform
    }

    pub fn shared(&self) -> SharedTexture {
        SharedTexture {
            texture: self.texture,
            transform: self.transform,
        }
    }

    pub fn queued_frames(&self) -> u64 {
        self.stream.queued_frames()
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_released()
    }

    pub fn release(&self) {
        self.stream.release();
    }
}

impl Drop for SurfaceTexture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Producer end of an image stream, handed to a camera.
#[derive(Clone)]
pub struct FrameProducer {
    stream: Arc<StreamInner>,
}

impl FrameProducer {
    /// Transform applied to every subsequently latched frame.
    pub fn set_transform(&self, transform: Mat4) {
        lock(&self.stream.state).transform = transform;
    }

    pub fn default_buffer_size(&self) -> Option<(u32, u32)> {
        lock(&self.stream.state).default_size
    }

    /// Frames of any other size are scaled to this size when queued.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) {
        lock(&self.stream.state).default_size = Some((width, height));
    }

    /// Replaces any frame not yet latched. Returns `false` once the consumer is gone.
    pub fn queue_frame(&self, frame: RgbaImage) -> bool {
        {
            let mut state = lock(&self.stream.state);
            if state.released {
                return false;
            }

            let frame = match state.default_size {
                Some((w, h)) if frame.dimensions() != (w, h) && w > 0 && h > 0 => {
                    image::imageops::resize(&frame, w, h, FilterType::Triangle)
                }
                _ => frame,
            };

            state.latest = Some(frame);
            state.queued += 1;
        }

        let listener = lock(&self.stream.listener).clone();
        if let Some(listener) = listener {
            listener();
        }
        true
    }

    pub fn is_released(&self) -> bool {
        lock(&self.stream.state).released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextConfig, EglSurface, MemoryWindow, Platform};
    use image::Rgba;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn current_context() -> Option<(GpuContext, EglSurface)> {
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
        Some((ctx, surface))
    }

    #[test]
    fn test_frame_available_and_latch() {
        let stream = ImageStream::new();

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = signals.clone();
        stream.set_on_frame_available(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let producer = stream.producer();
        producer.set_transform(Mat4::texture_rotation(90));
        assert!(producer.queue_frame(RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]))));
        assert!(producer.queue_frame(RgbaImage::from_pixel(2, 2, Rgba([4, 5, 6, 255]))));
        assert_eq!(signals.load(Ordering::SeqCst), 2);
        assert_eq!(stream.queued_frames(), 2);

        let (frame, transform) = stream.latch().unwrap().unwrap();
        assert_eq!(*frame.get_pixel(0, 0), Rgba([4, 5, 6, 255]));
        assert_eq!(transform, Mat4::texture_rotation(90));
        assert!(stream.latch().unwrap().is_none());
    }

    #[test]
    fn test_default_buffer_size_resizes() {
        let stream = ImageStream::new();
        stream.set_default_buffer_size(8, 4);

        stream.producer().queue_frame(RgbaImage::new(16, 8));
        let (latest, _) = stream.latch().unwrap().unwrap();
        assert_eq!(latest.dimensions(), (8, 4));
    }

    #[test]
    fn test_release_stops_producer() {
        let stream = ImageStream::new();
        let producer = stream.producer();

        stream.release();
        stream.release();
        assert!(producer.is_released());
        assert!(!producer.queue_frame(RgbaImage::new(1, 1)));
        assert_eq!(stream.latch(), Err(GpuError::Released));
    }

    #[test]
    fn test_update_uploads_latest_frame() {
        let Some((ctx, _surface)) = current_context() else {
            return;
        };
        let tex = ctx.gen_texture().unwrap();
        let mut st = SurfaceTexture::new(&ctx, tex).unwrap();

        let producer = st.producer();
        producer.set_transform(Mat4::texture_rotation(270));
        producer.queue_frame(RgbaImage::from_pixel(3, 2, Rgba([4, 5, 6, 255])));

        assert_eq!(st.update_tex_image(), Ok(true));
        assert_eq!(st.update_tex_image(), Ok(false));
        assert_eq!(st.transform_matrix(), Mat4::texture_rotation(270));

        let textures = ctx.inner.group.textures.read().unwrap();
        let uploaded = textures.get(&tex).unwrap().as_ref().unwrap();
        assert_eq!(
            (uploaded.texture.width(), uploaded.texture.height()),
            (3, 2)
        );
    }

    #[test]
    fn test_update_requires_current_context() {
        let Some((ctx, surface)) = current_context() else {
            return;
        };
        let tex = ctx.gen_texture().unwrap();
        let mut st = SurfaceTexture::new(&ctx, tex).unwrap();

        ctx.release_current();
        assert_eq!(st.update_tex_image(), Err(GpuError::NotCurrent));

        surface.make_current().unwrap();
        assert_eq!(st.update_tex_image(), Ok(false));

        st.release();
        assert_eq!(st.update_tex_image(), Err(GpuError::Released));
    }
}
