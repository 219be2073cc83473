//! A small EGL/GLES-shaped rendering layer on top of `wgpu`.
//!
//! Contexts are created in share groups. Every context of a group uses the
//! same `wgpu` device and queue, so a texture written on one thread can be
//! drawn by a second context current on another thread. Every context is
//! thread-affine: it is current on at most one thread, and moving it requires
//! `release_current` on the old thread first.
//!
//! Surfaces render into offscreen textures. `swap` reads the finished frame
//! back and hands it to a [`NativeWindow`], which is either an on-screen view
//! or the input of a video encoder.

mod context;
mod drawer;
mod error;
mod matrix;
mod surface;
mod texture;

pub use context::{
    ContextConfig, GpuContext, Platform, SharedContext, TARGET_FORMAT, TextureId, Viewport, gles,
};
pub use drawer::TextureDrawer;
pub use error::{GpuError, Result};
pub use image::{Rgba, RgbaImage};
pub use matrix::Mat4;
pub use surface::{EglSurface, MemoryWindow, NativeWindow};
pub use texture::{FrameProducer, ImageStream, SharedTexture, SurfaceTexture};
pub use wgpu;
