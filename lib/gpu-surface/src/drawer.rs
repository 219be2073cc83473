use crate::{
    GpuContext, GpuError, Mat4, Result, TextureId, Viewport,
    context::{ShareGroup, TARGET_FORMAT, lock, with_current},
};
use bytemuck::{Pod, Zeroable};
use std::{
    borrow::Cow,
    sync::{Arc, PoisonError},
};
use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadUniforms {
    mvp: [f32; 16],
    tex_matrix: [f32; 16],
    viewport: [f32; 4],
}

/// Draws a frame texture onto a full-viewport quad.
///
/// The quad spans `[-1, 1]` in both axes before the model-view-projection
/// matrix is applied. Texture coordinates go through the texture matrix that
/// came with the frame, so rotation and mirroring baked into a camera frame
/// are honored. The work is a single WGSL render pipeline; each `draw` is one
/// render pass into the surface that is current on the calling thread.
pub struct TextureDrawer {
    group: Arc<ShareGroup>,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    mvp: Mat4,
    released: bool,
}

impl std::fmt::Debug for TextureDrawer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureDrawer")
            .field("mvp", &self.mvp)
            .field("released", &self.released)
            .finish()
    }
}

impl TextureDrawer {
    pub fn new(context: &GpuContext) -> Result<Self> {
        context.check_frame_format()?;

        let group = context.inner.group.clone();
        let device = &group.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("textured quad"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/textured_quad.wgsl"
            ))),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("textured quad"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("textured quad"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("textured quad"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        // nearest when magnifying keeps texels crisp, linear when a large
        // camera frame is shrunk into a small view
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("textured quad"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            group,
            pipeline,
            bind_group_layout,
            sampler,
            mvp: Mat4::identity(),
            released: false,
        })
    }

    pub fn set_matrix(&mut self, mvp: Mat4) {
        self.mvp = mvp;
    }

    pub fn matrix(&self) -> Mat4 {
        self.mvp
    }

    /// Draws `texture` into the viewport of the current surface. A texture
    /// that has never received a frame draws nothing.
    pub fn draw(&self, texture: TextureId, tex_matrix: &Mat4) -> Result<()> {
        if self.released {
            return Err(GpuError::Released);
        }

        with_current(|b| {
            if !Arc::ptr_eq(&b.context.group, &self.group) {
                return Err(GpuError::InvalidTexture(texture.raw()));
            }

            let textures = self
                .group
                .textures
                .read()
                .unwrap_or_else(PoisonError::into_inner);

            let frame = match textures.get(&texture) {
                Some(Some(frame)) => frame,
                Some(None) => return Ok(()),
                None => return Err(GpuError::InvalidTexture(texture.raw())),
            };

            let target = lock(&b.surface.target);
            let Some(target) = target.as_ref() else {
                return Ok(());
            };

            let (target_w, target_h) = target.size();
            let viewport = lock(&b.context.state).viewport.unwrap_or(Viewport {
                x: 0,
                y: 0,
                width: target_w,
                height: target_h,
            });

            let Some(scissor) = scissor_rect(&viewport, target_w, target_h) else {
                return Ok(());
            };

            let uniforms = QuadUniforms {
                mvp: *self.mvp.as_array(),
                tex_matrix: *tex_matrix.as_array(),
                viewport: viewport_transform(&viewport, target_w, target_h),
            };

            let device = &self.group.device;
            let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("textured quad uniforms"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("textured quad"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&frame.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("textured quad"),
            });

            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("textured quad"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });

                let (x, y, w, h) = scissor;
                pass.set_scissor_rect(x, y, w, h);
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.draw(0..6, 0..1);
            }

            self.group.queue.submit(Some(encoder.finish()));
            Ok(())
        })
    }

    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Part of the viewport inside the target, flipped to top-left origin.
fn scissor_rect(viewport: &Viewport, target_w: u32, target_h: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = viewport.x.max(0) as i64;
    let y0 = viewport.y.max(0) as i64;
    let x1 = (viewport.x as i64 + viewport.width as i64).min(target_w as i64);
    let y1 = (viewport.y as i64 + viewport.height as i64).min(target_h as i64);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some((
        x0 as u32,
        (target_h as i64 - y1) as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}

/// Scale and offset taking viewport NDC to target NDC.
fn viewport_transform(viewport: &Viewport, target_w: u32, target_h: u32) -> [f32; 4] {
    let (tw, th) = (target_w as f32, target_h as f32);
    let (w, h) = (viewport.width as f32, viewport.height as f32);

    [
        w / tw,
        h / th,
        (2.0 * viewport.x as f32 + w) / tw - 1.0,
        (2.0 * viewport.y as f32 + h) / th - 1.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextConfig, EglSurface, MemoryWindow, Platform, gles};
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn quadrants() -> RgbaImage {
        // top-left red, top-right green, bottom-left blue, bottom-right white
        RgbaImage::from_fn(2, 2, |x, y| match (x, y) {
            (0, 0) => Rgba([255, 0, 0, 255]),
            (1, 0) => Rgba([0, 255, 0, 255]),
            (0, 1) => Rgba([0, 0, 255, 255]),
            _ => Rgba([255, 255, 255, 255]),
        })
    }

    fn context(platform: &Platform) -> Option<GpuContext> {
        match GpuContext::new(platform, None, ContextConfig::default()) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                eprintln!("Skipping test (no GPU): {e}");
                None
            }
        }
    }

    fn current_surface(ctx: &GpuContext, window: Arc<MemoryWindow>) -> EglSurface {
        let surface = ctx.create_window_surface(window).unwrap();
        surface.make_current().unwrap();
        surface
    }

    #[test]
    fn test_unsupported_frame_format() {
        let platform = Platform::default().with_frame_format(wgpu::TextureFormat::R32Uint);
        let Some(ctx) = context(&platform) else {
            return;
        };
        assert!(matches!(
            TextureDrawer::new(&ctx),
            Err(GpuError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_draw_identity_and_rotation() {
        let Some(ctx) = context(&Platform::default()) else {
            return;
        };
        let window = Arc::new(MemoryWindow::new(2, 2));
        let surface = current_surface(&ctx, window.clone());

        let tex = ctx.gen_texture().unwrap();
        ctx.inner.group.upload(tex, &quadrants()).unwrap();

        let drawer = TextureDrawer::new(&ctx).unwrap();
        drawer.draw(tex, &Mat4::identity()).unwrap();
        assert_eq!(surface.read_pixels().unwrap(), quadrants());

        // rotated 90 degrees clockwise: the bottom-left pixel moves to the top-left
        drawer.draw(tex, &Mat4::texture_rotation(90)).unwrap();
        let out = surface.read_pixels().unwrap();
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([255, 0, 0, 255]));

        surface.swap().unwrap();
        assert_eq!(window.presented_count(), 1);
        assert_eq!(window.last_frame(), Some(out));
    }

    #[test]
    fn test_mirror_and_crop() {
        let Some(ctx) = context(&Platform::default()) else {
            return;
        };
        let surface = current_surface(&ctx, Arc::new(MemoryWindow::new(4, 4)));
        gles::clear_color([9, 9, 9, 255]).unwrap();
        gles::clear().unwrap();

        let tex = ctx.gen_texture().unwrap();
        ctx.inner.group.upload(tex, &quadrants()).unwrap();

        let mut drawer = TextureDrawer::new(&ctx).unwrap();
        drawer.set_matrix(Mat4::scale(-2.0, 2.0, 1.0));
        drawer.draw(tex, &Mat4::identity()).unwrap();

        let out = surface.read_pixels().unwrap();
        assert!(out.pixels().all(|p| p.0 != [9, 9, 9, 255]));
        // mirrored: the top-left of the view shows the top-right of the frame
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_viewport_limits_draw() {
        let Some(ctx) = context(&Platform::default()) else {
            return;
        };
        let surface = current_surface(&ctx, Arc::new(MemoryWindow::new(4, 4)));
        gles::clear_color([0, 0, 0, 255]).unwrap();
        gles::clear().unwrap();

        let tex = ctx.gen_texture().unwrap();
        ctx.inner
            .group
            .upload(tex, &RgbaImage::from_pixel(1, 1, Rgba([200, 100, 50, 255])))
            .unwrap();

        // lower-left quarter in GL coordinates
        gles::viewport(0, 0, 2, 2).unwrap();
        TextureDrawer::new(&ctx)
            .unwrap()
            .draw(tex, &Mat4::identity())
            .unwrap();

        let out = surface.read_pixels().unwrap();
        assert_eq!(*out.get_pixel(0, 3), Rgba([200, 100, 50, 255]));
        assert_eq!(*out.get_pixel(1, 2), Rgba([200, 100, 50, 255]));
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(3, 3), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_draw_requires_current() {
        let Some(ctx) = context(&Platform::default()) else {
            return;
        };
        let drawer = TextureDrawer::new(&ctx).unwrap();
        assert_eq!(
            drawer.draw(TextureId(1), &Mat4::identity()),
            Err(GpuError::NotCurrent)
        );
    }

    #[test]
    fn test_scissor_clamps_to_target() {
        let full = Viewport {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
        };
        assert_eq!(scissor_rect(&full, 4, 4), Some((0, 0, 4, 4)));

        let offset = Viewport {
            x: -2,
            y: 1,
            width: 4,
            height: 8,
        };
        assert_eq!(scissor_rect(&offset, 4, 4), Some((0, 0, 2, 3)));

        let outside = Viewport {
            x: 5,
            y: 0,
            width: 2,
            height: 2,
        };
        assert_eq!(scissor_rect(&outside, 4, 4), None);
        assert_eq!(viewport_transform(&full, 4, 4), [1.0, 1.0, 0.0, 0.0]);
    }
}
