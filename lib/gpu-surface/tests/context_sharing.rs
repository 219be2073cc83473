use gpu_surface::{
    ContextConfig, GpuContext, GpuError, Mat4, MemoryWindow, Platform, Rgba, RgbaImage,
    SurfaceTexture, TextureDrawer,
};
use std::{sync::Arc, thread};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn display_context() -> Option<GpuContext> {
    match GpuContext::new(&Platform::default(), None, ContextConfig::default()) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("Skipping test (no GPU): {e}");
            None
        }
    }
}

#[test]
fn test_texture_visible_to_sharing_context() {
    init_logger();

    let Some(display) = display_context() else {
        return;
    };
    let display_surface = display
        .create_window_surface(Arc::new(MemoryWindow::new(4, 4)))
        .unwrap();
    display_surface.make_current().unwrap();

    let tex = display.gen_texture().unwrap();
    let mut st = SurfaceTexture::new(&display, tex).unwrap();
    st.producer()
        .queue_frame(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255])));
    assert!(st.update_tex_image().unwrap());

    let share = display.share_handle();
    let share_device = display.device();
    let encoder_window = Arc::new(MemoryWindow::new(3, 3));
    let window = encoder_window.clone();

    thread::spawn(move || {
        let ctx = GpuContext::new(
            share.platform(),
            Some(&share),
            ContextConfig { recordable: true },
        )
        .unwrap();
        let surface = ctx.create_window_surface(window).unwrap();
        surface.make_current().unwrap();

        assert!(ctx.has_texture(tex));
        assert!(Arc::ptr_eq(&ctx.device(), &share_device));
        let drawer = TextureDrawer::new(&ctx).unwrap();
        drawer.draw(tex, &Mat4::identity()).unwrap();
        surface.swap().unwrap();
    })
    .join()
    .unwrap();

    let frame = encoder_window.last_frame().unwrap();
    assert_eq!(frame.dimensions(), (3, 3));
    assert!(frame.pixels().all(|p| *p == Rgba([10, 20, 30, 255])));
}

#[test]
fn test_context_is_thread_affine() {
    init_logger();

    let Some(ctx) = display_context().map(Arc::new) else {
        return;
    };
    let surface = Arc::new(
        ctx.create_window_surface(Arc::new(MemoryWindow::new(2, 2)))
            .unwrap(),
    );
    surface.make_current().unwrap();
    assert!(ctx.is_current());

    let other = surface.clone();
    let err = thread::spawn(move || other.make_current()).join().unwrap();
    assert_eq!(err, Err(GpuError::ContextBusy(ctx.id())));

    ctx.release_current();
    assert!(!ctx.is_current());

    let other = surface.clone();
    let ctx_other = ctx.clone();
    let moved = thread::spawn(move || {
        other.make_current()?;
        let current = ctx_other.is_current();
        ctx_other.release_current();
        Ok::<_, GpuError>(current)
    })
    .join()
    .unwrap();
    assert_eq!(moved, Ok(true));

    surface.make_current().unwrap();
}

#[test]
fn test_textures_dropped_with_last_context() {
    init_logger();

    let Some(first) = display_context() else {
        return;
    };
    let surface = first
        .create_window_surface(Arc::new(MemoryWindow::new(1, 1)))
        .unwrap();
    surface.make_current().unwrap();
    let tex = first.gen_texture().unwrap();

    let share = first.share_handle();
    let second = GpuContext::new(share.platform(), Some(&share), ContextConfig::default()).unwrap();
    first.release();
    assert!(second.has_texture(tex));

    second.release();
    assert!(!second.has_texture(tex));
    assert!(matches!(
        GpuContext::new(share.platform(), Some(&share), ContextConfig::default()),
        Err(GpuError::Released)
    ));
}

#[test]
fn test_invalid_surface_rejected() {
    init_logger();

    let Some(ctx) = display_context() else {
        return;
    };
    let window = Arc::new(MemoryWindow::new(2, 2));
    let surface = ctx.create_window_surface(window.clone()).unwrap();
    surface.make_current().unwrap();

    window.invalidate();
    assert!(!surface.is_valid());
    assert_eq!(surface.swap(), Err(GpuError::SurfaceInvalid));
    assert_eq!(surface.make_current(), Err(GpuError::SurfaceInvalid));

    surface.release();
    surface.release();
}
