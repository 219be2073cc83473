use crate::{
    GpuContext, GpuError, Result,
    context::{ContextInner, ShareGroup, TARGET_FORMAT, lock, with_current},
};
use image::RgbaImage;
use std::sync::{
    Arc, Mutex, mpsc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

/// The platform window a surface renders into: an on-screen view or the
/// input of a hardware encoder.
pub trait NativeWindow: Send + Sync {
    fn size(&self) -> (u32, u32);

    fn is_valid(&self) -> bool {
        true
    }

    /// Receives a finished frame on swap.
    fn present(&self, frame: &RgbaImage);
}

/// Offscreen color attachment a surface draws into before swap.
pub(crate) struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl RenderTarget {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("surface back buffer"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }
}

pub(crate) struct SurfaceInner {
    pub context_id: u64,
    pub group: Arc<ShareGroup>,
    pub window: Arc<dyn NativeWindow>,

    // None while the window has a zero-sized edge
    pub target: Mutex<Option<RenderTarget>>,
    released: AtomicBool,
}

impl SurfaceInner {
    pub fn is_usable(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.window.is_valid()
    }

    pub fn sync_size(&self) {
        let (w, h) = self.window.size();
        let mut target = lock(&self.target);
        if target.as_ref().map(RenderTarget::size) == Some((w, h)) {
            return;
        }

        *target = (w > 0 && h > 0).then(|| RenderTarget::new(&self.group.device, w, h));
    }

    pub fn clear(&self, color: [u8; 4]) {
        let target = lock(&self.target);
        let Some(target) = target.as_ref() else {
            return;
        };

        let [r, g, b, a] = color.map(|c| c as f64 / 255.0);
        let mut encoder =
            self.group
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("surface clear"),
                });

        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("surface clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }

        self.group.queue.submit(Some(encoder.finish()));
    }

    /// Copies the render target back to the CPU.
    pub fn read_back(&self) -> Result<RgbaImage> {
        let target = lock(&self.target);
        let Some(target) = target.as_ref() else {
            let (w, h) = self.window.size();
            return Ok(RgbaImage::new(w, h));
        };

        let (width, height) = target.size();
        let device = &self.group.device;

        let unpadded = 4 * width;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("surface readback"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("surface readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.group.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            _ = tx.send(result);
        });

        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| GpuError::Device(format!("poll device failed: {e:?}")))?;
        rx.recv()
            .map_err(|e| GpuError::Device(format!("readback dropped: {e}")))?
            .map_err(|e| GpuError::Device(format!("map readback buffer failed: {e:?}")))?;

        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(padded as usize) {
                pixels.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        buffer.unmap();

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| GpuError::Device("short readback".to_string()))
    }
}

/// A drawable bound to a [`NativeWindow`]. Draws land in an offscreen
/// render target that is read back and handed to the window on `swap`.
pub struct EglSurface {
    context: Arc<ContextInner>,
    pub(crate) inner: Arc<SurfaceInner>,
}

impl GpuContext {
    pub fn create_window_surface(&self, window: Arc<dyn NativeWindow>) -> Result<EglSurface> {
        if self.is_released() {
            return Err(GpuError::Released);
        }
        if !window.is_valid() {
            return Err(GpuError::SurfaceInvalid);
        }

        let inner = Arc::new(SurfaceInner {
            context_id: self.inner.id,
            group: self.inner.group.clone(),
            window,
            target: Mutex::new(None),
            released: AtomicBool::new(false),
        });
        inner.sync_size();

        Ok(EglSurface {
            context: self.inner.clone(),
            inner,
        })
    }
}

impl EglSurface {
    /// Makes the owning context current on this thread, drawing into this surface.
    pub fn make_current(&self) -> Result<()> {
        self.context.bind(&self.inner)
    }

    /// Reads the back buffer and hands it to the window.
    pub fn swap(&self) -> Result<()> {
        with_current(|b| {
            if !Arc::ptr_eq(&b.surface, &self.inner) {
                return Err(GpuError::NotCurrent);
            }
            if !self.inner.is_usable() {
                return Err(GpuError::SurfaceInvalid);
            }

            let frame = self.inner.read_back()?;
            self.inner.window.present(&frame);
            Ok(())
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.inner.window.size()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_usable()
    }

    /// Copy of the back buffer, mostly useful to inspect a frame before `swap`.
    pub fn read_pixels(&self) -> Result<RgbaImage> {
        self.inner.read_back()
    }

    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.context.unbind_surface(&self.inner);
        lock(&self.inner.target).take();
    }
}

impl Drop for EglSurface {
    fn drop(&mut self) {
        self.release();
    }
}

/// An in-memory window: keeps the last presented frame around.
pub struct MemoryWindow {
    size: Mutex<(u32, u32)>,
    valid: AtomicBool,
    frame: Mutex<Option<RgbaImage>>,
    presented: AtomicU64,
}

impl MemoryWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Mutex::new((width, height)),
            valid: AtomicBool::new(true),
            frame: Mutex::new(None),
            presented: AtomicU64::new(0),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        *lock(&self.size) = (width, height);
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn last_frame(&self) -> Option<RgbaImage> {
        lock(&self.frame).clone()
    }

    pub fn presented_count(&self) -> u64 {
        self.presented.load(Ordering::Acquire)
    }
}

impl NativeWindow for MemoryWindow {
    fn size(&self) -> (u32, u32) {
        *lock(&self.size)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn present(&self, frame: &RgbaImage) {
        *lock(&self.frame) = Some(frame.clone());
        self.presented.fetch_add(1, Ordering::AcqRel);
    }
}
