use crate::{GpuError, Result, surface::SurfaceInner};
use image::RgbaImage;
use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
};

/// Format of every render target a surface draws into.
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which adapter a share group runs on and how camera frames are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,

    /// Only accept a software adapter such as lavapipe or WARP.
    pub force_fallback_adapter: bool,

    /// Texture format camera frames are uploaded into.
    pub frame_format: wgpu::TextureFormat,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            frame_format: wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

impl Platform {
    pub fn fallback() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::LowPower,
            force_fallback_adapter: true,
            ..Self::default()
        }
    }

    pub fn with_frame_format(mut self, format: wgpu::TextureFormat) -> Self {
        self.frame_format = format;
        self
    }

    /// True when an adapter matching this platform can be found.
    pub fn is_available(&self) -> bool {
        pollster::block_on(self.instance().request_adapter(&self.adapter_options())).is_ok()
    }

    fn instance(&self) -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: self.backends,
            ..Default::default()
        })
    }

    fn adapter_options(&self) -> wgpu::RequestAdapterOptions<'static, 'static> {
        wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            force_fallback_adapter: self.force_fallback_adapter,
            compatible_surface: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub(crate) u32);

impl TextureId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextConfig {
    /// The context will render into a surface that feeds a video encoder.
    pub recordable: bool,
}

/// Viewport in GL convention: `y` counts up from the bottom of the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub(crate) struct GlState {
    pub viewport: Option<Viewport>,
    pub clear_color: [u8; 4],
}

pub(crate) struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

/// Device, queue and textures visible to every context created against the
/// same group.
pub(crate) struct ShareGroup {
    pub platform: Platform,
    pub adapter: wgpu::Adapter,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub textures: RwLock<HashMap<TextureId, Option<GpuTexture>>>,
    next_texture: AtomicU32,
    live_contexts: AtomicUsize,
}

impl ShareGroup {
    fn new(platform: Platform) -> Result<Self> {
        let instance = platform.instance();
        let adapter = pollster::block_on(instance.request_adapter(&platform.adapter_options()))
            .map_err(|e| GpuError::NoAdapter(e.to_string()))?;

        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
                label: Some("gpu-surface share group"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults()
                    .using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            }))
            .map_err(|e| GpuError::Device(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            log::error!("wgpu error: {e}")
        }));

        let info = adapter.get_info();
        log::info!(
            "share group on {} ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        Ok(Self {
            platform,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            textures: RwLock::new(HashMap::new()),
            next_texture: AtomicU32::new(1),
            live_contexts: AtomicUsize::new(0),
        })
    }

    /// Frames must be RGBA8 and filterable so the quad pipeline can sample them.
    pub fn check_frame_format(&self) -> Result<()> {
        let format = self.platform.frame_format;
        if !matches!(
            format,
            wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb
        ) {
            return Err(GpuError::UnsupportedPlatform(format!(
                "{format:?} can't hold RGBA camera frames"
            )));
        }

        let features = self.adapter.get_texture_format_features(format);
        let usages = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if !features
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
            || !features.allowed_usages.contains(usages)
        {
            return Err(GpuError::UnsupportedPlatform(format!(
                "adapter can't sample {format:?} textures"
            )));
        }

        Ok(())
    }

    pub fn has_texture(&self, id: TextureId) -> bool {
        self.textures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Writes `image` into the texture, reallocating it when the frame size changes.
    pub fn upload(&self, id: TextureId, image: &RgbaImage) -> Result<()> {
        let mut textures = self
            .textures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = textures
            .get_mut(&id)
            .ok_or(GpuError::InvalidTexture(id.0))?;

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(());
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        if slot
            .as_ref()
            .is_none_or(|t| t.texture.width() != width || t.texture.height() != height)
        {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("camera frame"),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: self.platform.frame_format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            log::debug!("texture {} allocated at {width}x{height}", id.0);
            *slot = Some(GpuTexture { texture, view });
        }

        if let Some(gpu) = slot.as_ref() {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &gpu.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                image.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * width),
                    rows_per_image: Some(height),
                },
                size,
            );
        }

        Ok(())
    }
}

pub(crate) struct ContextInner {
    pub id: u64,
    pub group: Arc<ShareGroup>,
    pub config: ContextConfig,
    pub state: Mutex<GlState>,

    // thread the context is current on
    owner: Mutex<Option<ThreadId>>,
    released: AtomicBool,
}

impl ContextInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        // The thread-local may already be gone when a context is dropped during thread exit.
        let _ = CURRENT.try_with(|current| {
            let taken = {
                let mut current = current.borrow_mut();
                if current.as_ref().is_some_and(|b| b.context.id == self.id) {
                    current.take()
                } else {
                    None
                }
            };
            drop(taken);
        });
        *lock(&self.owner) = None;

        if self.group.live_contexts.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group
                .textures
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            log::debug!("last context of share group released, textures dropped");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn is_owned_by_this_thread(&self) -> bool {
        *lock(&self.owner) == Some(thread::current().id())
    }

    pub fn is_current(&self) -> bool {
        self.is_owned_by_this_thread()
            && CURRENT.with(|current| {
                current
                    .borrow()
                    .as_ref()
                    .is_some_and(|b| b.context.id == self.id)
            })
    }

    pub fn bind(self: &Arc<Self>, surface: &Arc<SurfaceInner>) -> Result<()> {
        if self.is_released() {
            return Err(GpuError::Released);
        }
        if surface.context_id != self.id {
            return Err(GpuError::SurfaceMismatch);
        }
        if !surface.is_usable() {
            return Err(GpuError::SurfaceInvalid);
        }

        let this_thread = thread::current().id();
        {
            let mut owner = lock(&self.owner);
            match *owner {
                Some(t) if t != this_thread => return Err(GpuError::ContextBusy(self.id)),
                _ => *owner = Some(this_thread),
            }
        }

        let previous = CURRENT.with(|current| {
            current.borrow_mut().replace(Binding {
                context: self.clone(),
                surface: surface.clone(),
            })
        });

        if let Some(previous) = previous
            && previous.context.id != self.id
        {
            *lock(&previous.context.owner) = None;
        }

        surface.sync_size();
        Ok(())
    }

    pub fn release_current(&self) {
        let taken = CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().is_some_and(|b| b.context.id == self.id) {
                current.take()
            } else {
                None
            }
        });

        if taken.is_some() {
            *lock(&self.owner) = None;
        }
    }

    /// Unbinds `surface` if it is what this thread draws into.
    pub fn unbind_surface(&self, surface: &Arc<SurfaceInner>) {
        let taken = CURRENT.try_with(|current| {
            let mut current = current.borrow_mut();
            if current
                .as_ref()
                .is_some_and(|b| Arc::ptr_eq(&b.surface, surface))
            {
                current.take()
            } else {
                None
            }
        });

        if let Ok(Some(_)) = taken {
            *lock(&self.owner) = None;
        }
    }
}

/// The context + surface pair that is current on one thread.
#[derive(Clone)]
pub(crate) struct Binding {
    pub context: Arc<ContextInner>,
    pub surface: Arc<SurfaceInner>,
}

/// Runs `f` against this thread's binding after checking that the context is
/// still owned by this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&Binding) -> Result<R>) -> Result<R> {
    let binding = CURRENT.with(|current| current.borrow().clone());
    match binding {
        Some(ref b) if !b.context.is_released() && b.context.is_owned_by_this_thread() => f(b),
        _ => Err(GpuError::NotCurrent),
    }
}

/// A handle to an existing context that other threads use to create a
/// sharing context. It carries no thread affinity.
#[derive(Clone)]
pub struct SharedContext {
    pub(crate) group: Arc<ShareGroup>,
    source_id: u64,
}

impl SharedContext {
    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    pub fn platform(&self) -> &Platform {
        &self.group.platform
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("source_id", &self.source_id)
            .finish()
    }
}

/// A rendering context over a shared `wgpu` device.
///
/// A context is current on at most one thread at a time. Moving it to another
/// thread needs `release_current` on the old thread before `make_current` on
/// the new one; trying otherwise fails with [`GpuError::ContextBusy`].
///
/// Contexts created with a [`SharedContext`] reuse the same device and queue,
/// so a texture written through one context can be sampled by all of them.
///
/// # Examples
///
/// ```no_run
/// use gpu_surface::{ContextConfig, GpuContext, MemoryWindow, Platform};
/// use std::sync::Arc;
///
/// let display = GpuContext::new(&Platform::default(), None, ContextConfig::default()).unwrap();
/// let surface = display
///     .create_window_surface(Arc::new(MemoryWindow::new(640, 480)))
///     .unwrap();
/// surface.make_current().unwrap();
///
/// let share = display.share_handle();
/// std::thread::spawn(move || {
///     let relay = GpuContext::new(
///         share.platform(),
///         Some(&share),
///         ContextConfig { recordable: true },
///     )
///     .unwrap();
///     assert_eq!(relay.platform(), share.platform());
/// })
/// .join()
/// .unwrap();
/// ```
pub struct GpuContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl GpuContext {
    /// Creates a context. With `share`, the new context joins the shared
    /// group and uses its device; otherwise a new adapter and device are opened.
    pub fn new(
        platform: &Platform,
        share: Option<&SharedContext>,
        config: ContextConfig,
    ) -> Result<Self> {
        let group = match share {
            Some(shared) => {
                if shared.group.live_contexts.load(Ordering::Acquire) == 0 {
                    return Err(GpuError::Released);
                }
                shared.group.clone()
            }
            None => Arc::new(ShareGroup::new(platform.clone())?),
        };
        group.live_contexts.fetch_add(1, Ordering::AcqRel);

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "create context {id} (shared: {}, recordable: {})",
            share.map(|s| s.source_id).unwrap_or_default(),
            config.recordable
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                group,
                config,
                state: Mutex::new(GlState {
                    viewport: None,
                    clear_color: [0, 0, 0, 255],
                }),
                owner: Mutex::new(None),
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> ContextConfig {
        self.inner.config
    }

    pub fn platform(&self) -> &Platform {
        &self.inner.group.platform
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.inner.group.adapter.get_info()
    }

    pub fn device(&self) -> Arc<wgpu::Device> {
        self.inner.group.device.clone()
    }

    pub fn queue(&self) -> Arc<wgpu::Queue> {
        self.inner.group.queue.clone()
    }

    /// Fails with [`GpuError::UnsupportedPlatform`] when camera frames can't
    /// be sampled on this adapter.
    pub fn check_frame_format(&self) -> Result<()> {
        self.inner.group.check_frame_format()
    }

    pub fn share_handle(&self) -> SharedContext {
        SharedContext {
            group: self.inner.group.clone(),
            source_id: self.inner.id,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    /// True when this context is current on the calling thread.
    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }

    /// Drops currency on the calling thread. No-op when not current here.
    pub fn release_current(&self) {
        self.inner.release_current();
    }

    /// Allocates a frame texture in the share group. Storage is created on
    /// the first upload.
    pub fn gen_texture(&self) -> Result<TextureId> {
        if self.is_released() || !self.is_current() {
            return Err(GpuError::NotCurrent);
        }
        self.check_frame_format()?;

        let group = &self.inner.group;
        let id = TextureId(group.next_texture.fetch_add(1, Ordering::Relaxed));
        group
            .textures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, None);
        Ok(id)
    }

    pub fn delete_texture(&self, id: TextureId) {
        let removed = self
            .inner
            .group
            .textures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if removed.is_none() {
            log::debug!("delete unknown texture {}", id.0);
        }
    }

    pub fn has_texture(&self, id: TextureId) -> bool {
        self.inner.group.has_texture(id)
    }

    /// Tears the context down. Safe to call more than once.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// GLES-style state calls against whatever is current on this thread.
pub mod gles {
    use super::*;

    pub fn viewport(x: i32, y: i32, width: u32, height: u32) -> Result<()> {
        with_current(|b| {
            lock(&b.context.state).viewport = Some(Viewport {
                x,
                y,
                width,
                height,
            });
            Ok(())
        })
    }

    pub fn clear_color(rgba: [u8; 4]) -> Result<()> {
        with_current(|b| {
            lock(&b.context.state).clear_color = rgba;
            Ok(())
        })
    }

    /// Fills the current surface with the clear color.
    pub fn clear() -> Result<()> {
        with_current(|b| {
            let color = lock(&b.context.state).clear_color;
            b.surface.clear(color);
            Ok(())
        })
    }
}
