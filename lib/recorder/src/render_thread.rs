use crate::{
    RecorderError, Result,
    compositor::{ConsumerSlot, FrameCompositor, FrameConsumer},
};
use crossbeam::channel::{Receiver, Sender, bounded, select, unbounded};
use gpu_surface::{ContextConfig, EglSurface, FrameProducer, GpuContext, NativeWindow, Platform};
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

enum RenderRequest {
    SurfaceCreated {
        window: Arc<dyn NativeWindow>,
        done: Sender<Result<FrameProducer>>,
    },
    SurfaceChanged {
        width: u32,
        height: u32,
    },
    VideoSize {
        width: u32,
        height: u32,
    },
    AttachConsumer {
        consumer: Arc<dyn FrameConsumer>,
        done: Sender<Result<()>>,
    },
    SurfaceDestroyed {
        done: Sender<()>,
    },
    Exit,
}

/// The on-screen render loop. It owns the display context and only draws
/// when a redraw was requested, usually by a new camera frame.
pub struct DisplayRenderer {
    requests: Sender<RenderRequest>,
    redraw: Sender<()>,
    consumer: ConsumerSlot,
    frames: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Option<ThreadId>,
}

impl DisplayRenderer {
    pub fn new(platform: Platform, encode_every_nth_draw: u32) -> Self {
        let (requests, request_receiver) = unbounded();
        let (redraw, redraw_receiver) = bounded(1);

        let redraw_sender = redraw.clone();
        let compositor = FrameCompositor::new(encode_every_nth_draw, move || {
            _ = redraw_sender.try_send(());
        });
        let consumer = compositor.consumer_slot();
        let frames = Arc::new(AtomicU64::new(0));

        let worker = RenderWorker {
            platform,
            compositor,
            context: None,
            surface: None,
            frames: frames.clone(),
        };

        let handle = thread::Builder::new()
            .name("display-render".to_string())
            .spawn(move || worker.run(request_receiver, redraw_receiver));

        let (worker, worker_id) = match handle {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                log::error!("spawn display render thread failed: {e}");
                (None, None)
            }
        };

        Self {
            requests,
            redraw,
            consumer,
            frames,
            worker: Mutex::new(worker),
            worker_id,
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_id == Some(thread::current().id())
    }

    fn worker_gone() -> RecorderError {
        RecorderError::InvalidState("display render thread exited".to_string())
    }

    /// Creates the display context and the camera texture for `window`.
    /// Returns the producer a camera pushes frames into.
    pub fn on_surface_created(&self, window: Arc<dyn NativeWindow>) -> Result<FrameProducer> {
        let (done, result) = bounded(1);
        self.requests
            .send(RenderRequest::SurfaceCreated { window, done })
            .map_err(|_| Self::worker_gone())?;
        result.recv().map_err(|_| Self::worker_gone())?
    }

    pub fn on_surface_changed(&self, width: u32, height: u32) {
        _ = self
            .requests
            .send(RenderRequest::SurfaceChanged { width, height });
        self.request_render();
    }

    /// Upright size of the camera video, used for the aspect-fit transform.
    pub fn set_video_size(&self, width: u32, height: u32) {
        _ = self.requests.send(RenderRequest::VideoSize { width, height });
    }

    /// Pending redraw requests collapse into one.
    pub fn request_render(&self) {
        _ = self.redraw.try_send(());
    }

    /// Binds `consumer` to the display texture on the render thread.
    pub fn attach_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> Result<()> {
        let (done, result) = bounded(1);
        self.requests
            .send(RenderRequest::AttachConsumer { consumer, done })
            .map_err(|_| Self::worker_gone())?;
        result.recv().map_err(|_| Self::worker_gone())?
    }

    /// Stops forwarding frames. Safe from any thread.
    pub fn detach_consumer(&self) {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Releases the texture and the display context. Waits for the render
    /// thread unless called from it.
    pub fn on_surface_destroyed(&self) {
        let (done, finished) = bounded(1);
        if self
            .requests
            .send(RenderRequest::SurfaceDestroyed { done })
            .is_err()
        {
            return;
        }

        if !self.on_worker_thread() {
            _ = finished.recv();
        }
    }

    /// Number of frames presented on the display surface.
    pub fn presented_frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        _ = self.requests.send(RenderRequest::Exit);

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
            log::warn!("display render thread panicked");
        }
    }
}

impl Drop for DisplayRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RenderWorker {
    platform: Platform,
    compositor: FrameCompositor,
    context: Option<GpuContext>,
    surface: Option<EglSurface>,
    frames: Arc<AtomicU64>,
}

impl RenderWorker {
    fn run(mut self, requests: Receiver<RenderRequest>, redraw: Receiver<()>) {
        log::debug!("display render thread start");

        loop {
            select! {
                recv(requests) -> request => match request {
                    Ok(RenderRequest::Exit) | Err(_) => break,
                    Ok(request) => self.handle(request),
                },
                recv(redraw) -> _ => self.draw_frame(),
            }
        }

        self.destroy_surface();
        log::debug!("display render thread exit");
    }

    fn handle(&mut self, request: RenderRequest) {
        match request {
            RenderRequest::SurfaceCreated { window, done } => {
                let result = self.create_surface(window);
                if let Err(ref e) = result {
                    log::warn!("create display surface failed: {e}");
                    self.destroy_surface();
                }
                _ = done.send(result);
            }
            RenderRequest::SurfaceChanged { width, height } => {
                if let Some(surface) = self.surface.as_ref()
                    && let Err(e) = surface
                        .make_current()
                        .map_err(RecorderError::from)
                        .and_then(|_| self.compositor.on_surface_changed(width, height))
                {
                    log::warn!("resize display surface failed: {e}");
                }
            }
            RenderRequest::VideoSize { width, height } => {
                if let Err(e) = self.compositor.set_video_size(width, height) {
                    log::debug!("update viewport failed: {e}");
                }
            }
            RenderRequest::AttachConsumer { consumer, done } => {
                _ = done.send(self.compositor.attach_consumer(consumer));
            }
            RenderRequest::SurfaceDestroyed { done } => {
                self.destroy_surface();
                _ = done.send(());
            }
            RenderRequest::Exit => (),
        }
    }

    fn create_surface(&mut self, window: Arc<dyn NativeWindow>) -> Result<FrameProducer> {
        self.destroy_surface();

        let context = GpuContext::new(&self.platform, None, ContextConfig::default())?;
        let surface = context.create_window_surface(window)?;
        surface.make_current()?;
        self.compositor.on_surface_created(&context)?;

        let producer = self
            .compositor
            .frame_producer()
            .ok_or_else(|| RecorderError::InvalidState("no display texture".to_string()))?;

        let (width, height) = surface.size();
        self.compositor.on_surface_changed(width, height)?;

        self.context = Some(context);
        self.surface = Some(surface);
        Ok(producer)
    }

    fn draw_frame(&mut self) {
        let Some(surface) = self.surface.as_ref() else {
            return;
        };

        let result = surface
            .make_current()
            .map_err(RecorderError::from)
            .and_then(|_| self.compositor.on_draw_frame())
            .and_then(|_| surface.swap().map_err(RecorderError::from));

        match result {
            Ok(_) => {
                self.frames.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => log::debug!("draw display frame failed: {e}"),
        }
    }

    fn destroy_surface(&mut self) {
        if let Some(context) = self.context.take() {
            self.compositor.on_surface_destroyed(&context);
            if let Some(surface) = self.surface.take() {
                surface.release();
            }
            context.release();
        }
        self.surface = None;
    }
}
